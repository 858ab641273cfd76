//! `flint collections <collection> <action> ...`

use anyhow::{bail, Result};
use flint::records::{parse_record_input, split_list, ListOptions, RecordList};
use flint::App;
use serde_json::Value;

use super::{authorized_backend, confirm};
use crate::cli::{CollectionsArgs, RecordAction};
use crate::output::{self, Printer};

pub fn run(app: &mut App, printer: &Printer, args: CollectionsArgs) -> Result<()> {
    let env = app.usable_environment()?;
    let collection = app.check_collection(&env, &args.collection)?;
    let records = authorized_backend(&env)?;
    let collection = collection.as_str();

    match args.action {
        RecordAction::List => {
            expect_args(&args, 0, "list")?;
            let options = ListOptions {
                page: args.page,
                per_page: args.per_page.unwrap_or(app.preferences().pagination_size),
                filter: args.filter.clone(),
                sort: args.sort.clone(),
                fields: split_list(args.fields.as_deref()),
                expand: split_list(args.expand.as_deref()),
            };
            let list = app.list_records(&records, collection, &options)?;
            print_list(printer, &list)
        }
        RecordAction::Get => {
            expect_args(&args, 1, "get <id>")?;
            let record = app.get_record(
                &records,
                collection,
                &args.args[0],
                &split_list(args.expand.as_deref()),
            )?;
            printer.print(&record)
        }
        RecordAction::Create => {
            if args.args.len() > 1 {
                bail!("usage: flint collections {} create [json] [--file path]", collection);
            }
            let data = parse_record_input(args.args.first().map(String::as_str), args.file.as_deref())?;
            let record = app.create_record(&records, collection, &data)?;
            if printer.is_table() {
                output::success(&format!("Created {} record {}", collection, record_id(&record)));
            }
            printer.print(&record)
        }
        RecordAction::Update => {
            if args.args.is_empty() || args.args.len() > 2 {
                bail!("usage: flint collections {} update <id> [json] [--file path]", collection);
            }
            let data = parse_record_input(args.args.get(1).map(String::as_str), args.file.as_deref())?;
            let record = app.update_record(&records, collection, &args.args[0], &data)?;
            if printer.is_table() {
                output::success(&format!("Updated {} record {}", collection, args.args[0]));
            }
            printer.print(&record)
        }
        RecordAction::Delete => {
            expect_args(&args, 1, "delete <id>")?;
            let id = &args.args[0];
            if !args.force && !confirm(&format!("Delete {} record '{}'?", collection, id))? {
                println!("Cancelled");
                return Ok(());
            }
            app.delete_record(&records, collection, id)?;
            output::success(&format!("Deleted {} record {}", collection, id));
            Ok(())
        }
    }
}

fn expect_args(args: &CollectionsArgs, count: usize, usage: &str) -> Result<()> {
    if args.args.len() != count {
        bail!("usage: flint collections {} {}", args.collection, usage);
    }
    Ok(())
}

fn record_id(record: &serde_json::Map<String, Value>) -> &str {
    record.get("id").and_then(Value::as_str).unwrap_or("")
}

fn print_list(printer: &Printer, list: &RecordList) -> Result<()> {
    if !printer.is_table() {
        return printer.print(list);
    }
    printer.print(&list.items)?;
    println!();
    println!("{}", page_footer(list));
    Ok(())
}

fn page_footer(list: &RecordList) -> String {
    format!(
        "Page {} of {} ({} records, {} per page)",
        list.page,
        list.total_pages.max(1),
        list.total_items,
        list.per_page
    )
}
