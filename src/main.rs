fn main() -> anyhow::Result<()> {
    cronvault::cli::run()
}
