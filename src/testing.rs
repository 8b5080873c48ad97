use std::collections::VecDeque;
use std::process::Command;
use std::sync::{Arc, Mutex};

use crate::error::{PzmError, Result};
use crate::types::RunMode;
use crate::util::command::{render_command, CommandOutput, CommandRunner, Runner};
use crate::util::prompt::Prompter;

type SideEffect = Box<dyn Fn(&str) + Send + Sync>;

struct Rule {
    pattern: String,
    outputs: VecDeque<CommandOutput>,
    effect: Option<SideEffect>,
}

/// Answers commands from pattern rules. The first rule whose pattern is a
/// substring of the rendered command line wins; a rule with several queued
/// outputs hands them out in order and repeats the last one. Unmatched
/// commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, pattern: &str, code: i32, stdout: &str) {
        self.on_sequence(pattern, vec![output(code, stdout, "")]);
    }

    pub fn on_sequence(&self, pattern: &str, outputs: Vec<CommandOutput>) {
        self.push(pattern, outputs, None);
    }

    pub fn on_effect<F>(&self, pattern: &str, code: i32, stdout: &str, effect: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.push(pattern, vec![output(code, stdout, "")], Some(Box::new(effect)));
    }

    fn push(&self, pattern: &str, outputs: Vec<CommandOutput>, effect: Option<SideEffect>) {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            outputs: outputs.into_iter().collect(),
            effect,
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, pattern: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.contains(pattern))
            .collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn output(&self, cmd: &mut Command) -> std::io::Result<CommandOutput> {
        let line = render_command(cmd);
        self.calls.lock().unwrap().push(line.clone());
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if !line.contains(&rule.pattern) {
                continue;
            }
            if let Some(effect) = &rule.effect {
                effect(&line);
            }
            let out = if rule.outputs.len() > 1 {
                rule.outputs.pop_front().unwrap_or_default()
            } else {
                rule.outputs.front().cloned().unwrap_or_default()
            };
            return Ok(out);
        }
        Ok(CommandOutput::default())
    }
}

pub fn output(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

pub fn runner(scripted: &Arc<ScriptedRunner>) -> Runner {
    Runner::new(scripted.clone(), RunMode::default())
}

pub fn dry_runner(scripted: &Arc<ScriptedRunner>) -> Runner {
    Runner::new(
        scripted.clone(),
        RunMode {
            dry_run: true,
            verbose: false,
        },
    )
}

/// Replays canned answers and remembers every question asked.
#[derive(Default)]
pub struct ScriptedPrompter {
    answers: VecDeque<String>,
    pub questions: Vec<String>,
}

impl ScriptedPrompter {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: answers.iter().map(|a| a.to_string()).collect(),
            questions: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.answers.len()
    }
}

impl Prompter for ScriptedPrompter {
    fn ask(&mut self, question: &str) -> Result<String> {
        self.questions.push(question.to_string());
        self.answers
            .pop_front()
            .ok_or_else(|| PzmError::message(format!("no scripted answer for: {}", question)))
    }
}
