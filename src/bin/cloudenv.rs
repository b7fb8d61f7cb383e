use anyhow::Result;

fn main() -> Result<()> {
    cloudenv::cli::run()
}
