use anyhow::Result;

fn main() -> Result<()> {
    pwmetrics::cli::run()
}
