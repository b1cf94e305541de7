use super::OutputFormat;
use anyhow::{Result, anyhow};
use clap::Args;
use coffre_core::ObjectId;
use coffre_core::catalog::{TreeEntry, tree};
use coffre_core::object::EntryKind;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use std::str::FromStr;

#[derive(Args)]
pub struct TreeCommand {
    #[arg(help = "Object id to walk")]
    id: String,

    #[arg(long, help = "Maximum depth to expand (unlimited when omitted)")]
    depth: Option<i32>,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Human, help = "Output format")]
    format: OutputFormat,
}

impl TreeCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (store, scheduler) = super::open_store(cli).await?;

        let id = ObjectId::from_str(&self.id)
            .map_err(|_| anyhow!("Invalid object id '{}'", self.id))?;
        let max_depth = match self.depth {
            Some(depth) if depth < 0 => return Err(anyhow!("Depth must be 0 or more")),
            Some(depth) => depth,
            None => -1,
        };

        let rows = tree(store, &scheduler, &id, max_depth).await?;

        match self.format {
            OutputFormat::Human => print_human(&rows),
            OutputFormat::Json => print_json(&rows)?,
            OutputFormat::Xml => print_xml(&rows)?,
        }
        Ok(())
    }
}

fn kind_letter(kind: EntryKind) -> char {
    match kind {
        EntryKind::Directory => 'd',
        EntryKind::File => 'f',
        EntryKind::Link => 'l',
    }
}

fn print_human(rows: &[TreeEntry]) {
    for row in rows {
        let indent = row.depth * 2;
        let suffix = if row.kind == EntryKind::Directory { "/" } else { "" };

        let detail = if let Some(size) = row.size {
            super::format_size(size)
        } else if let Some(target) = &row.target {
            format!("-> {target}")
        } else if !row.readable {
            "?".to_string()
        } else {
            String::new()
        };

        println!(
            "{:indent$}[{}] {}{} (0{:o}) {}",
            "",
            kind_letter(row.kind),
            row.name,
            suffix,
            row.mode,
            detail,
        );
    }
}

fn print_json(rows: &[TreeEntry]) -> Result<()> {
    let entries: Vec<_> = rows
        .iter()
        .map(|row| {
            serde_json::json!({
                "type": row.kind.to_string(),
                "id": row.id.to_hex(),
                "name": row.name,
                "depth": row.depth,
                "mtime": row.mtime,
                "mode": format!("0o{:o}", row.mode),
                "size": row.size,
                "target": row.target,
                "readable": row.readable,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

fn print_xml(rows: &[TreeEntry]) -> Result<()> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);

    writer.write_event(Event::Start(BytesStart::new("Entries")))?;
    for row in rows {
        let mut element = BytesStart::new("Entry");
        element.push_attribute(("type", row.kind.to_string().as_str()));
        element.push_attribute(("id", row.id.to_hex().as_str()));
        element.push_attribute(("name", row.name.as_str()));
        element.push_attribute(("depth", row.depth.to_string().as_str()));
        element.push_attribute(("mtime", row.mtime.to_string().as_str()));
        element.push_attribute(("mode", format!("0o{:o}", row.mode).as_str()));
        if let Some(size) = row.size {
            element.push_attribute(("size", size.to_string().as_str()));
        }
        if let Some(target) = &row.target {
            element.push_attribute(("target", target.as_str()));
        }
        element.push_attribute(("readable", if row.readable { "true" } else { "false" }));
        writer.write_event(Event::Empty(element))?;
    }
    writer.write_event(Event::End(BytesEnd::new("Entries")))?;

    println!("{}", String::from_utf8(writer.into_inner())?);
    Ok(())
}
