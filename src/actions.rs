/// Actions that can be dispatched through the daemon's main loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// A message from the operator for the agent
    Prompt(String),
    /// Show the current session's token accounting
    Status,
    /// Forget the session so the next prompt starts fresh
    ResetSession,
    /// A side question answered outside the ongoing conversation
    Ask(String),
    /// Drop the last exchange from the conversation
    PruneLastTurn,
    /// Output of a background task meant for the operator
    Notify(String),
    /// Request to shut the daemon down
    Quit,
}

impl Action {
    /// Interpret one line of console input; blank lines yield nothing
    pub fn from_input(line: &str) -> Option<Self> {
        let line = line.trim();
        if let Some(question) = line.strip_prefix("/ask ") {
            return Some(Action::Ask(question.trim().to_string()));
        }
        match line {
            "" | "/ask" => None,
            "/status" => Some(Action::Status),
            "/reset" => Some(Action::ResetSession),
            "/prune" => Some(Action::PruneLastTurn),
            "/quit" | "/exit" => Some(Action::Quit),
            _ => Some(Action::Prompt(line.to_string())),
        }
    }
}
