use super::OutputFormat;
use anyhow::Result;
use clap::Args;
use coffre_core::catalog::{SnapshotInfo, list_snapshots};
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, Event};

#[derive(Args)]
pub struct ListCommand {
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Human, help = "Output format")]
    format: OutputFormat,
}

impl ListCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (store, scheduler) = super::open_store(cli).await?;
        let snapshots = list_snapshots(store, &scheduler).await?;

        match self.format {
            OutputFormat::Human => print_human(&snapshots),
            OutputFormat::Json => print_json(&snapshots)?,
            OutputFormat::Xml => print_xml(&snapshots)?,
        }
        Ok(())
    }
}

fn print_human(snapshots: &[SnapshotInfo]) {
    if snapshots.is_empty() {
        println!("There does not seem to be any snapshot");
        return;
    }

    for snapshot in snapshots {
        println!("{}", snapshot.id);
        if let Some(name) = &snapshot.name {
            println!("+ Name: {name}");
        }
        println!("+ Time: {}", super::format_time(snapshot.time));
        println!("+ Size: {}", super::format_size(snapshot.len));
        println!("+ Storage: {}", super::format_size(snapshot.stored));
        println!();
    }
}

fn print_json(snapshots: &[SnapshotInfo]) -> Result<()> {
    let rows: Vec<_> = snapshots
        .iter()
        .map(|snapshot| {
            serde_json::json!({
                "id": snapshot.id.to_hex(),
                "name": snapshot.name,
                "time": snapshot.time,
                "size": snapshot.len,
                "storage": snapshot.stored,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

fn print_xml(snapshots: &[SnapshotInfo]) -> Result<()> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);

    writer.write_event(Event::Start(BytesStart::new("Snapshots")))?;
    for snapshot in snapshots {
        let mut element = BytesStart::new("Snapshot");
        element.push_attribute(("id", snapshot.id.to_hex().as_str()));
        element.push_attribute(("name", snapshot.name.as_deref().unwrap_or("")));
        element.push_attribute(("time", snapshot.time.to_string().as_str()));
        element.push_attribute(("size", snapshot.len.to_string().as_str()));
        element.push_attribute(("storage", snapshot.stored.to_string().as_str()));
        writer.write_event(Event::Empty(element))?;
    }
    writer.write_event(Event::End(BytesEnd::new("Snapshots")))?;

    println!("{}", String::from_utf8(writer.into_inner())?);
    Ok(())
}
