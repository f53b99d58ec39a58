use console::{Emoji, style};

static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_step(step: &str) {
    println!("{} {}", SPARKLE, style(step).bold());
}

/// A titled block of `command  description` rows for help screens.
pub struct HelpSection {
    title: String,
    rows: Vec<(String, String)>,
}

impl HelpSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn command(mut self, usage: &str, description: &str) -> Self {
        self.rows.push((usage.to_string(), description.to_string()));
        self
    }

    pub fn print(&self) {
        println!("\n {}", style(&self.title).bold().underlined());
        let width = self.rows.iter().map(|(u, _)| u.len()).max().unwrap_or(0);
        for (usage, description) in &self.rows {
            let padded = format!("{:<width$}", usage, width = width);
            println!("   {}  {}", style(padded).cyan(), style(description).dim());
        }
    }
}
