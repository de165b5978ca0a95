use anyhow::Result;

pub fn execute() -> Result<()> {
    println!("bedside version {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
