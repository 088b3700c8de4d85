mod args;
mod ctx;
mod health;

use anyhow::Result;
use clap::Parser;

pub(crate) mod consts {
    pub const NAME: &str = "cloudengine-operator";
}

#[tokio::main]
async fn main() -> Result<()> {
    self::args::Args::parse().run().await
}
