fn main() -> anyhow::Result<()> {
    uie_lib::run()
}
