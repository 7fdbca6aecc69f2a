use anyhow::Result;

fn main() -> Result<()> {
    colex_cli::run()
}
