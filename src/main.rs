fn main() -> anyhow::Result<()> {
    rolechat_lib::run()
}
