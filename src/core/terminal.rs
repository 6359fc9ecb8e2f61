use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");
pub static BRANCH: Emoji<'_, '_> = Emoji("🌿 ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_step(step: &str) {
    println!("{} {}", SPARKLE, style(step).bold());
}

pub fn print_branch(label: &str, branch: &str) {
    println!("  {} {}: {}", BRANCH, style(label).bold(), style(branch).cyan());
}

/// Titled block of aligned rows for help and report output.
pub struct GuideSection {
    title: String,
    rows: Vec<Row>,
}

enum Row {
    Command(String, String),
    Status(String, String),
    Text(String),
    Hint(String, String),
    Blank,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.rows
            .push(Row::Command(name.to_string(), description.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.rows
            .push(Row::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.rows.push(Row::Text(text.to_string()));
        self
    }

    pub fn hint(mut self, command: &str, note: &str) -> Self {
        self.rows
            .push(Row::Hint(command.to_string(), note.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.rows.push(Row::Blank);
        self
    }

    pub fn print(&self) {
        println!("\n {}", style(&self.title).bold().underlined());
        let width = self
            .rows
            .iter()
            .filter_map(|row| match row {
                Row::Command(name, _) => Some(name.len()),
                Row::Status(label, _) => Some(label.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        for row in &self.rows {
            match row {
                Row::Command(name, description) => println!(
                    "   {}  {}",
                    style(format!("{:<width$}", name)).green(),
                    description
                ),
                Row::Status(label, value) => println!(
                    "   {}  {}",
                    style(format!("{:<width$}", label)).cyan(),
                    value
                ),
                Row::Text(text) => println!("   {}", text),
                Row::Hint(command, note) if note.is_empty() => {
                    println!("   {} {}", style("$").dim(), style(command).yellow())
                }
                Row::Hint(command, note) => println!(
                    "   {} {}  {}",
                    style("$").dim(),
                    style(command).yellow(),
                    style(note).dim()
                ),
                Row::Blank => println!(),
            }
        }
    }
}

pub fn print_banner() {
    let lines: &[&str] = &[
        "                                      ",
        "  ___ ___  _ ____   _____  _   _     ",
        " / __/ _ \\| '_ \\ \\ / / _ \\| | | |    ",
        "| (_| (_) | | | \\ V / (_) | |_| |    ",
        " \\___\\___/|_| |_|\\_/ \\___/ \\__, |    ",
        "                            |___/     ",
    ];

    // Diagonal gradient from amber to teal.
    let stops: [(u8, u8, u8); 3] = [(251, 191, 36), (52, 211, 153), (45, 212, 191)];
    let max_w = 38u32;
    let max_d = max_w + 5 * 10;

    println!();
    for (y, line) in lines.iter().enumerate() {
        for (x, ch) in line.chars().enumerate() {
            if ch == ' ' {
                print!(" ");
                continue;
            }
            let d = ((x as u32 + y as u32 * 10) * 1000 / max_d).min(1000);
            let (r, g, b) = if d <= 500 {
                lerp_color(stops[0], stops[1], d * 2)
            } else {
                lerp_color(stops[1], stops[2], (d - 500) * 2)
            };
            print!("\x1b[38;2;{};{};{}m{}", r, g, b, ch);
        }
        println!();
    }
    print!("\x1b[0m");

    println!("\x1b[38;2;45;212;191mMany hands, one line.\x1b[0m");
}

fn lerp_color(a: (u8, u8, u8), b: (u8, u8, u8), t: u32) -> (u8, u8, u8) {
    let r = (a.0 as u32 * (1000 - t) + b.0 as u32 * t) / 1000;
    let g = (a.1 as u32 * (1000 - t) + b.1 as u32 * t) / 1000;
    let b_val = (a.2 as u32 * (1000 - t) + b.2 as u32 * t) / 1000;
    (r as u8, g as u8, b_val as u8)
}
