//! `weft schema`: print the workflow definition JSON Schema.

use anyhow::Result;
use weft_core::workflow::definition::workflow_schema;

pub fn handle_schema() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&workflow_schema())?);
    Ok(())
}
