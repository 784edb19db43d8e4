use std::io::{self, Write};

use anyhow::Result;
use bat::WrappingMode;
use cliclack::spinner;
use console::style;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use serde_json::Value;
use tether::models::content::Content;
use tether::models::message::{Message, MessageContent, ToolRequest, ToolResponse};
use tether::models::role::Role;

use super::{Input, InputType, Prompt, Theme};

const PROMPT: &str = "\x1b[1m\x1b[38;5;30m| \x1b[0m";
const MAX_STRING_LENGTH: usize = 40;
const INDENT: &str = "    ";
const BUSY_MESSAGE: &str = "(AI is thinking...)";

pub struct RustylinePrompt {
    editor: DefaultEditor,
    spinner: cliclack::ProgressBar,
    busy: bool,
    theme: Theme,
}

impl RustylinePrompt {
    pub fn new() -> Result<Self> {
        Ok(RustylinePrompt {
            editor: DefaultEditor::new()?,
            spinner: spinner(),
            busy: false,
            theme: Theme::Dark,
        })
    }

    fn theme_name(&self) -> &'static str {
        match self.theme {
            Theme::Light => "GitHub",
            Theme::Dark => "zenburn",
        }
    }
}

fn print_request(tool_request: &ToolRequest) {
    let call = &tool_request.tool_call;
    println!(
        "{} {}",
        style("(Trying to use tool").dim(),
        style(format!("`{}`)", call.name)).magenta().dim()
    );
    print_params(&call.arguments, 1);
}

fn print_response(tool_response: &ToolResponse, theme: &str) {
    match &tool_response.tool_result {
        Ok(contents) => {
            println!("{}", style("(Used tool successfully!)").green().dim());
            for content in contents {
                match content {
                    Content::Text(text) => print_markdown(&text.text, theme),
                    Content::Image(image) => println!("{}Image: [type: {}]", INDENT, image.mime_type),
                }
            }
        }
        Err(e) => {
            println!("{}", style("(Failed to use tool!)").red().dim());
            println!("{}{}", INDENT, style(e).red());
        }
    }
}

fn print_markdown(content: &str, theme: &str) {
    let printed = bat::PrettyPrinter::new()
        .input(bat::Input::from_bytes(content.as_bytes()))
        .theme(theme)
        .language("Markdown")
        .wrapping_mode(WrappingMode::Character)
        .print();
    if printed.is_err() {
        println!("{}", content);
    }
}

/// Format and print parameters recursively with proper indentation and colors
fn print_params(value: &Value, depth: usize) {
    let indent = INDENT.repeat(depth);

    match value {
        Value::Object(map) => {
            for (key, val) in map {
                match val {
                    Value::Object(_) => {
                        println!("{}{}:", indent, style(key).dim());
                        print_params(val, depth + 1);
                    }
                    Value::Array(arr) => {
                        println!("{}{}:", indent, style(key).dim());
                        for item in arr.iter() {
                            println!("{}{}- ", indent, INDENT);
                            print_params(item, depth + 2);
                        }
                    }
                    Value::String(s) => {
                        if s.len() > MAX_STRING_LENGTH {
                            println!("{}{}: {}", indent, style(key).dim(), style("...").dim());
                        } else {
                            println!("{}{}: {}", indent, style(key).dim(), style(s).green());
                        }
                    }
                    Value::Number(n) => {
                        println!("{}{}: {}", indent, style(key).dim(), style(n).blue());
                    }
                    Value::Bool(b) => {
                        println!("{}{}: {}", indent, style(key).dim(), style(b).blue());
                    }
                    Value::Null => {
                        println!("{}{}: {}", indent, style(key).dim(), style("null").dim());
                    }
                }
            }
        }
        Value::Array(arr) => {
            for (i, item) in arr.iter().enumerate() {
                println!("{}{}.", indent, i + 1);
                print_params(item, depth + 1);
            }
        }
        Value::String(s) => {
            if s.len() > MAX_STRING_LENGTH {
                println!(
                    "{}{}",
                    indent,
                    style(format!("[REDACTED: {} chars]", s.len())).yellow()
                );
            } else {
                println!("{}{}", indent, style(s).green());
            }
        }
        Value::Number(n) => {
            println!("{}{}", indent, style(n).yellow());
        }
        Value::Bool(b) => {
            println!("{}{}", indent, style(b).yellow());
        }
        Value::Null => {
            println!("{}{}", indent, style("null").dim());
        }
    }
}

/// Turn a line of input into a session command or a message
fn parse_input(line: &str) -> Input {
    let text = line.trim();
    let command = |input_type| Input {
        input_type,
        content: None,
    };

    if text.is_empty() {
        return command(InputType::AskAgain);
    }
    match text.to_ascii_lowercase().as_str() {
        "/exit" | "/quit" => command(InputType::Exit),
        "/retry" => command(InputType::Retry),
        "/logs" => command(InputType::Logs),
        _ => Input {
            input_type: InputType::Message,
            content: Some(text.to_string()),
        },
    }
}

fn print_help() {
    println!("Commands:");
    println!("/exit - Exit the session");
    println!("/retry - Repeat the last request after a failure or an interrupt");
    println!("/logs - Show the session log");
    println!("/t - Toggle Light/Dark theme");
    println!("/? | /help - Display this help message");
    println!("Ctrl+C - Interrupt the current request (running tools are answered as cancelled)");
}

impl Prompt for RustylinePrompt {
    fn render(&mut self, message: &Message) {
        let was_busy = self.busy;
        if was_busy {
            self.hide_busy();
        }
        let theme = self.theme_name();

        let author = match message.role {
            Role::User => style("You:").cyan().bold(),
            Role::Assistant => style("Claude:").magenta().bold(),
        };
        println!("{}", author);

        for message_content in &message.content {
            match message_content {
                // The user's own words are already on screen from the input line
                MessageContent::Text(_) if message.role == Role::User => {}
                MessageContent::Text(text) => print_markdown(&text.text, theme),
                MessageContent::ToolRequest(tool_request) => print_request(tool_request),
                MessageContent::ToolResponse(tool_response) => print_response(tool_response, theme),
                MessageContent::Pending => println!("{}", style(BUSY_MESSAGE).dim()),
            }
        }

        println!();
        let _ = io::stdout().flush();
        if was_busy {
            self.show_busy();
        }
    }

    fn show_busy(&mut self) {
        self.spinner = spinner();
        self.spinner.start(BUSY_MESSAGE);
        self.busy = true;
    }

    fn hide_busy(&mut self) {
        if self.busy {
            self.spinner.stop("");
            self.busy = false;
        }
    }

    fn notice(&self, text: &str) {
        println!("{}", style(text).dim());
    }

    fn error(&self, text: &str) {
        println!("{} {}", style("ERROR:").red().bold(), text);
    }

    fn get_input(&mut self) -> Result<Input> {
        let line = match self.editor.readline(PROMPT) {
            Ok(line) => line,
            Err(e) => {
                match e {
                    ReadlineError::Interrupted | ReadlineError::Eof => (),
                    _ => eprintln!("Input error: {}", e),
                }
                return Ok(Input {
                    input_type: InputType::Exit,
                    content: None,
                });
            }
        };
        let _ = self.editor.add_history_entry(line.trim());

        let text = line.trim();
        if text.eq_ignore_ascii_case("/t") {
            self.theme = match self.theme {
                Theme::Light => {
                    println!("Switching to Dark theme");
                    Theme::Dark
                }
                Theme::Dark => {
                    println!("Switching to Light theme");
                    Theme::Light
                }
            };
            return Ok(Input {
                input_type: InputType::AskAgain,
                content: None,
            });
        }
        if text.eq_ignore_ascii_case("/?") || text.eq_ignore_ascii_case("/help") {
            print_help();
            return Ok(Input {
                input_type: InputType::AskAgain,
                content: None,
            });
        }

        Ok(parse_input(text))
    }

    fn close(&self) {
        // No cleanup required
    }
}
