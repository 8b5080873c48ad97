use std::io::{self, BufRead, Write};

use crate::error::{PzmError, Result};

/// Source of operator answers during plan construction.
pub trait Prompter {
    fn ask(&mut self, question: &str) -> Result<String>;
}

pub struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn ask(&mut self, question: &str) -> Result<String> {
        print!("{}", question);
        io::stdout().flush()?;
        let mut line = String::new();
        let read = io::stdin().lock().read_line(&mut line)?;
        if read == 0 {
            return Err(PzmError::Aborted);
        }
        Ok(line.trim().to_string())
    }
}

/// Asks until the answer (case-insensitive) is one of `choices`.
pub fn ask_choice(prompter: &mut dyn Prompter, question: &str, choices: &[&str]) -> Result<String> {
    let mut answer = prompter.ask(question)?.to_ascii_lowercase();
    while !choices.contains(&answer.as_str()) {
        answer = prompter
            .ask(&format!("Please answer {}: ", choices.join("/")))?
            .to_ascii_lowercase();
    }
    Ok(answer)
}

pub fn ask_yes_no(prompter: &mut dyn Prompter, question: &str) -> Result<bool> {
    Ok(ask_choice(prompter, question, &["y", "n"])? == "y")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedPrompter;

    #[test]
    fn reprompts_until_valid_answer() {
        let mut prompter = ScriptedPrompter::new(&["maybe", "", "Y"]);
        assert!(ask_yes_no(&mut prompter, "Restore? (y/n): ").unwrap());
        assert_eq!(prompter.questions.len(), 3);
        assert_eq!(prompter.questions[1], "Please answer y/n: ");
    }

    #[test]
    fn choice_is_lowercased() {
        let mut prompter = ScriptedPrompter::new(&["KEEP"]);
        let answer = ask_choice(&mut prompter, "Fate? ", &["rollback", "keep"]).unwrap();
        assert_eq!(answer, "keep");
    }
}
