use anyhow::Result;
use colored::Colorize;
use edb_core::Error;

use super::Store;
use crate::display::print_record;

pub fn run(store: &Store, oid: &str, at: Option<i64>) -> Result<()> {
    let service = store.open()?;

    let found = match at {
        Some(timestamp) => service.get_object_in_stage_at(oid, store.stage(), timestamp),
        None => service.get_object_in_stage(oid, store.stage()),
    };

    match found {
        Ok(record) => {
            print_record(&record);
            Ok(())
        }
        Err(Error::ObjectNotFound(_)) => {
            println!("{} {}", "No live object".yellow(), oid.bold());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
