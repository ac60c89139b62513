use clap::Args;

use super::GlobalArgs;
use crate::identity::IdentityResolver;
use crate::record::NodeId;

#[derive(Debug, Args)]
pub struct WhoamiArgs {
    /// Override the detected identity (useful to check config precedence)
    #[arg(long, value_enum)]
    pub node: Option<NodeId>,
    /// Also print where the identity came from
    #[arg(long)]
    pub explain: bool,
}

impl WhoamiArgs {
    pub fn execute(&self, global: &GlobalArgs) -> anyhow::Result<()> {
        let config = global.load_config()?;
        let identity = IdentityResolver::from_process_env(self.node, &config.identity).resolve()?;

        if self.explain {
            println!("{}\t{}", identity.node, identity.source);
        } else {
            println!("{}", identity.node);
        }
        Ok(())
    }
}
