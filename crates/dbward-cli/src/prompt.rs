use std::io::{BufRead, IsTerminal};

use dbward_common::{Error, Result};
use dbward_db::{Confirm, ConfirmationRequest};
use dialoguer::Input;

/// Asks the operator on the terminal. Without a terminal, the answer is the
/// next line of stdin so scripted runs can pipe it in.
pub struct TerminalConfirmer;

impl Confirm for TerminalConfirmer {
    fn confirm(&self, request: &ConfirmationRequest) -> Result<String> {
        println!();
        println!("  About to {}", request.action);
        println!("  {}", request.details);
        println!();

        let prompt = format!("Type '{}' to continue", request.phrase);
        if std::io::stdin().is_terminal() {
            return Input::<String>::new()
                .with_prompt(prompt)
                .allow_empty(true)
                .interact_text()
                .map_err(|e| Error::ConfirmationAborted(format!("prompt cancelled: {e}")));
        }

        println!("{prompt}:");
        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        Ok(answer)
    }
}
