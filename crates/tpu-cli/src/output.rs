//! Output formatting for the tpuinfo CLI

use anyhow::Result;
use clap::ValueEnum;
use colored::*;
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use serde::Serialize;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Types that can be rendered as table rows
pub trait Formattable {
    fn table_headers() -> Vec<&'static str>;
    fn table_row(&self) -> Vec<String>;
}

/// Output formatter
pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print a single item as key/value pairs or a serialized document
    pub fn print_item<T: Serialize>(&self, item: &T, pairs: &[(&str, String)]) -> Result<()> {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(item)?),
            OutputFormat::Yaml => print!("{}", serde_yaml::to_string(item)?),
            OutputFormat::Table => {
                for (key, value) in pairs {
                    println!("{}: {}", key.bold().cyan(), value);
                }
            }
        }
        Ok(())
    }

    /// Print a list of items
    pub fn print_list<T>(&self, items: &[T]) -> Result<()>
    where
        T: Serialize + Formattable,
    {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(items)?),
            OutputFormat::Yaml => print!("{}", serde_yaml::to_string(items)?),
            OutputFormat::Table if items.is_empty() => {
                println!("{}", "No TPU devices found".dimmed());
            }
            OutputFormat::Table => println!("{}", render_table(items)),
        }
        Ok(())
    }

    /// Print a failed query with its status code
    pub fn print_failure(&self, operation: &str, status: i32) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let result = serde_json::json!({
                    "status": "error",
                    "operation": operation,
                    "code": status,
                });
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            OutputFormat::Yaml => {
                println!("status: error");
                println!("operation: {}", operation);
                println!("code: {}", status);
            }
            OutputFormat::Table => {
                eprintln!(
                    "{} {}",
                    "✗".red().bold(),
                    format!("{} failed with status {}", operation, status).red()
                );
            }
        }
        Ok(())
    }
}

/// Render items as a table
pub fn render_table<T: Formattable>(items: &[T]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let header: Vec<Cell> = T::table_headers()
        .into_iter()
        .map(|h| Cell::new(h).add_attribute(Attribute::Bold).fg(Color::Cyan))
        .collect();
    table.set_header(header);

    for item in items {
        table.add_row(item.table_row());
    }
    table
}

/// Format a byte count with a binary unit
pub fn format_bytes(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value.abs() >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Row {
        name: &'static str,
    }

    impl Formattable for Row {
        fn table_headers() -> Vec<&'static str> {
            vec!["Name"]
        }

        fn table_row(&self) -> Vec<String> {
            vec![self.name.to_string()]
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(34_359_738_368), "32.00 GiB");
    }

    #[test]
    fn test_render_table_contains_rows() {
        let rendered = render_table(&[Row { name: "v5e" }, Row { name: "v6e" }]).to_string();
        assert!(rendered.contains("Name"));
        assert!(rendered.contains("v5e"));
        assert!(rendered.contains("v6e"));
    }

    #[test]
    fn test_default_format_is_table() {
        assert_eq!(OutputFormat::default(), OutputFormat::Table);
    }
}
