fn main() -> anyhow::Result<()> {
    geotec_ledger::cli::run()
}
