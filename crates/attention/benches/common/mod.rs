use std::{fs, path::Path};

const RESULTS_PATH: &str = "crates/attention/benchmarks/RESULTS.md";

/// Rows of a markdown table under fixed headers.
pub struct MarkdownTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl MarkdownTable {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn render(&self) -> String {
        let line = |cells: &[String]| format!("| {} |\n", cells.join(" | "));
        let divider = vec!["---".to_string(); self.headers.len()];
        let mut table = line(&self.headers);
        table.push_str(&line(&divider));
        for row in &self.rows {
            table.push_str(&line(row));
        }
        table
    }
}

/// Replaces (or appends) the `<!-- SECTION_START -->` block of the results file.
pub fn write_section(section: &str, content: &str) -> std::io::Result<()> {
    let tag = section.to_uppercase().replace(' ', "_");
    let start_marker = format!("<!-- {tag}_START -->");
    let end_marker = format!("<!-- {tag}_END -->");
    let block = format!("{start_marker}\n{content}\n{end_marker}\n");

    let path = Path::new(RESULTS_PATH);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut body = if path.exists() {
        fs::read_to_string(path)?
    } else {
        "# Attention Strategy Benchmarks\n\n".to_string()
    };

    match (body.find(&start_marker), body.find(&end_marker)) {
        (Some(start), Some(end)) if start < end => {
            let mut stop = end + end_marker.len();
            if body[stop..].starts_with('\n') {
                stop += 1;
            }
            body.replace_range(start..stop, &block);
        }
        _ => {
            if !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&block);
        }
    }
    fs::write(path, body)
}
