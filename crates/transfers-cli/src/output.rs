//! Transfer summaries for the terminal and for machines

use chrono::{DateTime, Utc};
use console::style;
use serde::Serialize;
use transfers_types::{TaskStatus, TransferDetails};
use uuid::Uuid;

/// JSON summary of a finished transfer
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSummaryJson {
    /// CLI version
    pub version: String,
    /// Top task id
    pub id: Uuid,
    /// Final status of the top task
    pub status: TaskStatus,
    /// Tag from the request
    pub tag: Option<String>,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Completion time
    pub end_time: Option<DateTime<Utc>>,
    /// Wall clock seconds from creation to completion
    pub elapsed_seconds: Option<f64>,
    /// Bytes expected over all elements
    pub total_bytes: u64,
    /// Bytes moved over all elements
    pub bytes_transferred: u64,
    /// Top task error, if any
    pub error_message: Option<String>,
    /// One entry per request element
    pub elements: Vec<ElementSummaryJson>,
}

/// JSON summary of one request element
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementSummaryJson {
    /// Parent task id
    pub id: Uuid,
    /// Source URI
    pub source_uri: String,
    /// Destination URI
    pub destination_uri: String,
    /// Final parent status
    pub status: TaskStatus,
    /// Whether failure of this element is tolerated
    pub optional: bool,
    /// Bytes expected
    pub total_bytes: u64,
    /// Bytes moved
    pub bytes_transferred: u64,
    /// Number of child tasks staged
    pub children: usize,
    /// Number of child tasks that did not complete
    pub failed_children: usize,
    /// Final message set on completion
    pub final_message: Option<String>,
    /// Failure reason
    pub error_message: Option<String>,
}

impl From<&TransferDetails> for TransferSummaryJson {
    fn from(details: &TransferDetails) -> Self {
        let task = &details.task;
        let elements: Vec<ElementSummaryJson> = details
            .parents
            .iter()
            .map(|entry| {
                let parent = &entry.parent;
                ElementSummaryJson {
                    id: parent.id,
                    source_uri: parent.source_uri.to_string(),
                    destination_uri: parent.destination_uri.to_string(),
                    status: parent.status,
                    optional: parent.optional,
                    total_bytes: parent.total_bytes,
                    bytes_transferred: parent.bytes_transferred,
                    children: entry.children.len(),
                    failed_children: entry
                        .children
                        .iter()
                        .filter(|child| child.status != TaskStatus::Completed)
                        .count(),
                    final_message: parent.final_message.clone(),
                    error_message: parent.error_message.clone(),
                }
            })
            .collect();

        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            id: task.id,
            status: task.status,
            tag: task.tag.clone(),
            created: task.created,
            end_time: task.end_time,
            elapsed_seconds: task
                .end_time
                .map(|end| (end - task.created).num_milliseconds() as f64 / 1000.0),
            total_bytes: elements.iter().map(|e| e.total_bytes).sum(),
            bytes_transferred: elements.iter().map(|e| e.bytes_transferred).sum(),
            error_message: task.error_message.clone(),
            elements,
        }
    }
}

/// Print the summary as pretty JSON on stdout
pub fn print_json(details: &TransferDetails) -> anyhow::Result<()> {
    let summary = TransferSummaryJson::from(details);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Print a human readable summary
pub fn print_summary(details: &TransferDetails) {
    let summary = TransferSummaryJson::from(details);

    println!();
    println!("{}", style("Transfer Summary").bold().underlined());
    println!("  {} {}", style("Transfer:").bold(), summary.id);
    if let Some(tag) = &summary.tag {
        println!("  {} {}", style("Tag:").bold(), tag);
    }
    println!("  {} {}", style("Status:").bold(), styled_status(summary.status));
    println!(
        "  {} {} / {}",
        style("Bytes:").bold(),
        format_bytes(summary.bytes_transferred),
        format_bytes(summary.total_bytes)
    );
    if let Some(seconds) = summary.elapsed_seconds {
        println!("  {} {:.2}s", style("Elapsed:").bold(), seconds);
    }
    if let Some(error) = &summary.error_message {
        println!("  {} {}", style("Error:").red().bold(), error);
    }

    println!();
    for element in &summary.elements {
        println!(
            "  {} {} {} {}",
            styled_status(element.status),
            element.source_uri,
            style("→").green().bold(),
            element.destination_uri
        );
        println!(
            "      {} files, {}{}",
            element.children,
            format_bytes(element.total_bytes),
            if element.optional { ", optional" } else { "" }
        );
        if let Some(message) = element.error_message.as_ref().or(element.final_message.as_ref()) {
            println!("      {}", style(message).dim());
        }
    }
}

fn styled_status(status: TaskStatus) -> console::StyledObject<&'static str> {
    let text = style(status.as_str()).bold();
    match status {
        TaskStatus::Completed => text.green(),
        TaskStatus::FailedOpt | TaskStatus::Cancelled => text.yellow(),
        TaskStatus::Failed => text.red(),
        _ => text.cyan(),
    }
}

/// Format bytes in human readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
