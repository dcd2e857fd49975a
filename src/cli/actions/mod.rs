pub mod server;

/// What the parsed command line asks the binary to do.
#[derive(Debug)]
pub enum Action {
    /// Serve the identity provider over HTTP.
    Server(server::Args),
}

impl Action {
    /// # Errors
    /// Whatever the selected action fails with.
    pub async fn execute(self) -> anyhow::Result<()> {
        match self {
            Self::Server(args) => server::execute(args).await,
        }
    }
}
