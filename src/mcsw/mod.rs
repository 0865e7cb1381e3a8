pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod minecraft;
pub mod pidfile;
pub mod properties;

pub fn main() -> anyhow::Result<()> {
    cli::run()
}
