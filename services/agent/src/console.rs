//! The operator console: stdin lines in, interviewer lines out.

use interview_core::Stage;

/// One line typed at the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// A candidate turn.
    Say(String),
    Next,
    Stage(String),
    Status,
    Quit,
    Empty,
}

impl Input {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Input::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Input::Say(line.to_string());
        };
        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };
        match name {
            "next" => Input::Next,
            "stage" => Input::Stage(arg.to_string()),
            "status" => Input::Status,
            "quit" | "exit" => Input::Quit,
            // Not an operator command; treat it as something the candidate said.
            _ => Input::Say(line.to_string()),
        }
    }
}

/// Stand-in for a generated interviewer reply to a candidate turn.
pub fn follow_up_line(stage: Stage) -> &'static str {
    match stage {
        Stage::Experience => "What was the hardest part of that, and how did you handle it?",
        _ => "Interesting. Could you tell me a bit more about that?",
    }
}
