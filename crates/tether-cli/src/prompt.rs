use anyhow::Result;
use tether::models::message::Message;

pub mod rustyline;

pub trait Prompt {
    fn render(&mut self, message: &Message);
    fn get_input(&mut self) -> Result<Input>;
    fn show_busy(&mut self);
    fn hide_busy(&mut self);
    /// A line from the session itself rather than the conversation
    fn notice(&self, text: &str);
    fn error(&self, text: &str);
    fn close(&self);
    fn ready(&self) {
        println!("\nWelcome! Chat to Claude, or type /help to see the commands.\n");
    }
}

pub struct Input {
    pub input_type: InputType,
    pub content: Option<String>, // Set only for InputType::Message
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    AskAgain, // Ask the user for input again. Control flow command.
    Message,  // User sent a message
    Retry,    // Repeat the last failed request
    Logs,     // Show the session log
    Exit,     // User wants to exit the session
}

pub enum Theme {
    Light,
    Dark,
}
