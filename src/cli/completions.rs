use std::io::{self, Write};

use clap::{CommandFactory, Parser};
use clap_complete::{generate, Shell};

use super::Options;

/// Print shell completions for treewatch.
#[derive(Debug, Parser)]
pub struct CompletionsCommand {
    /// Shell to generate completions for.
    #[clap(value_enum)]
    pub shell: Shell,
}

impl CompletionsCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let mut stdout = io::stdout().lock();
        self.write_to(&mut stdout);
        stdout.flush()?;
        Ok(())
    }

    fn write_to(&self, out: &mut dyn Write) {
        let mut command = Options::command();
        let name = command.get_name().to_owned();
        generate(self.shell, &mut command, name, out);
    }
}
