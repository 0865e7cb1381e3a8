fn main() -> anyhow::Result<()> {
    mcswd::mcsw::main()
}
