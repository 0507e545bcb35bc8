//! `burrow commit` — Save a container's filesystem as an image.

use burrow_runtime::Engine;
use clap::Args;

/// Arguments for the `commit` command.
#[derive(Args, Debug)]
pub struct CommitArgs {
    /// Container name.
    pub container: String,

    /// Name of the image to write.
    pub image: String,
}

/// Executes the `commit` command.
///
/// # Errors
///
/// Returns an error if the container is unknown or the archive cannot be
/// written.
pub fn execute(engine: &Engine, args: &CommitArgs) -> anyhow::Result<()> {
    let archive = engine.commit(&args.container, &args.image)?;
    println!("{}", archive.display());
    Ok(())
}
