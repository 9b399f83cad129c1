use chrono::Utc;
use tracing::info;

use crate::{
    domain::SessionId,
    settings::{Mode, Toggle},
    Result,
};

use super::{CommandContext, EventRouter};

/// Commands anyone may run once the mode gate passed.
const OPEN_COMMANDS: &[&str] = &["menu", "help", "ping", "stats"];

/// Commands reserved for the session's owner.
const OWNER_COMMANDS: &[&str] = &[
    "setprefix",
    "mode",
    "alwaysonline",
    "autoread",
    "autoreact",
    "autostatus",
    "statusreact",
    "welcome",
    "listbots",
    "sd",
    "delete-session",
    "owner",
];

pub(super) fn is_builtin(name: &str) -> bool {
    OPEN_COMMANDS.contains(&name) || OWNER_COMMANDS.contains(&name)
}

/// Split `<prefix><name> <args>` into a lowercase name and trimmed args.
pub fn parse_command(text: &str, prefix: &str) -> Option<(String, String)> {
    let body = text.trim().strip_prefix(prefix)?;
    let mut parts = body.trim_start().splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or("").trim().to_lowercase();
    if cmd.is_empty() {
        return None;
    }
    let rest = parts.next().unwrap_or("").trim().to_string();
    Some((cmd, rest))
}

fn reaction_for(cmd: &str) -> &'static str {
    match cmd {
        "menu" | "help" => "📂",
        "ping" => "🏓",
        "stats" => "📊",
        "setprefix" => "⚙️",
        "mode" => "🛡️",
        "alwaysonline" => "🟢",
        "autoread" => "👁️",
        "autoreact" => "💖",
        "autostatus" => "📺",
        "statusreact" => "🔥",
        "welcome" => "👋",
        "listbots" => "🤖",
        "sd" | "delete-session" => "💀",
        "owner" => "👑",
        _ => "⚙️",
    }
}

fn on_off(v: bool) -> &'static str {
    if v {
        "ON"
    } else {
        "OFF"
    }
}

fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if days > 0 {
        return format!("{days}d {hours}h {mins}m");
    }
    if hours > 0 {
        return format!("{hours}h {mins}m {secs}s");
    }
    if mins > 0 {
        return format!("{mins}m {secs}s");
    }
    format!("{secs}s")
}

impl EventRouter {
    pub(super) async fn run_builtin(
        &self,
        cmd: &str,
        ctx: &CommandContext,
        args: &str,
    ) -> Result<()> {
        if OWNER_COMMANDS.contains(&cmd) && !ctx.is_owner {
            return Ok(());
        }

        let id = ctx.session.id();
        let prefix = ctx.settings.prefix.as_str();
        self.submit_reaction(&ctx.session, &ctx.message, reaction_for(cmd));

        match cmd {
            "menu" | "help" => {
                let name = ctx.message.push_name.as_deref().unwrap_or("User");
                let mut lines = vec![
                    format!("👋 Hi {name}"),
                    format!("🤖 Bot: {id} | Mode: {} | Prefix: {prefix}", ctx.settings.mode),
                    String::new(),
                    "📌 General".to_string(),
                ];
                lines.extend(OPEN_COMMANDS.iter().map(|c| format!("   {prefix}{c}")));
                let mut external: Vec<&String> = self.external.keys().collect();
                external.sort();
                lines.extend(external.into_iter().map(|c| format!("   {prefix}{c}")));
                if ctx.is_owner {
                    lines.push(String::new());
                    lines.push("👑 Owner".to_string());
                    lines.extend(OWNER_COMMANDS.iter().map(|c| format!("   {prefix}{c}")));
                }
                ctx.reply(&lines.join("\n")).await
            }

            "ping" => ctx.reply("pong").await,

            "stats" => {
                let now = Utc::now();
                let s = &ctx.settings;
                let mut lines = vec![
                    "📊 Bot stats".to_string(),
                    format!("🤖 Session: {id}"),
                    format!(
                        "⏱️ Connected for: {}",
                        format_duration((now - ctx.session.connected_at()).num_seconds())
                    ),
                    format!(
                        "🕰️ Process uptime: {}",
                        format_duration((now - self.started_at).num_seconds())
                    ),
                    format!("👥 Active bots: {}", self.registry.len().await),
                    format!("🔒 Mode: {} | Prefix: {}", s.mode, s.prefix),
                ];
                for t in Toggle::ALL {
                    lines.push(format!("   {}: {}", t.command(), on_off(s.is_on(t))));
                }
                if let Some(at) = ctx.session.last_presence().await {
                    lines.push(format!(
                        "🟢 Last presence: {} ago",
                        format_duration((now - at).num_seconds())
                    ));
                }
                ctx.reply(&lines.join("\n")).await
            }

            "setprefix" => {
                let Some(new_prefix) = args.split_whitespace().next() else {
                    return ctx.reply(&format!("Usage: {prefix}setprefix <prefix>")).await;
                };
                let new_prefix = new_prefix.to_string();
                let stored = self
                    .settings
                    .update(id, |s| {
                        s.prefix = new_prefix;
                        s.prefix.clone()
                    })
                    .await;
                info!(%id, prefix = %stored, "prefix changed");
                ctx.reply(&format!("🔧 Prefix set to: {stored}")).await
            }

            "mode" => {
                let Some(mode) = Mode::parse(args) else {
                    return ctx
                        .reply(&format!(
                            "Usage: {prefix}mode public|admin|private\nCurrent: {}",
                            ctx.settings.mode
                        ))
                        .await;
                };
                self.settings.update(id, |s| s.mode = mode).await;
                info!(%id, %mode, "mode changed");
                ctx.reply(&format!("🔒 Mode set to: {mode}")).await
            }

            "listbots" => {
                let ids = self.registry.list().await;
                let mut lines = vec![format!("🤖 Active bots ({})", ids.len())];
                for (i, bot) in ids.iter().enumerate() {
                    let marker = if bot == id { " (this)" } else { "" };
                    lines.push(format!("{}. {bot}{marker}", i + 1));
                }
                ctx.reply(&lines.join("\n")).await
            }

            "sd" | "delete-session" => {
                let Some(target) = args
                    .split_whitespace()
                    .next()
                    .and_then(SessionId::from_loose)
                else {
                    return ctx.reply(&format!("Usage: {prefix}{cmd} <number>")).await;
                };
                if self.registry.get(&target).await.is_none() {
                    return ctx.reply(&format!("⚠️ No live session for {target}")).await;
                }

                ctx.reply(&format!("💀 Deleting session {target}...")).await?;
                info!(%id, %target, "session deletion requested by owner");
                self.registry.remove(&target).await;
                Ok(())
            }

            "owner" => {
                let linked = self.identities.linked(id).await;
                let lines = [
                    "👑 Owner check".to_string(),
                    format!("Sender: {}", ctx.message.sender),
                    format!("Primary: {id}"),
                    format!("Linked: {}", linked.as_deref().unwrap_or("unknown")),
                    format!("Owner: {}", if ctx.is_owner { "yes" } else { "no" }),
                ];
                ctx.reply(&lines.join("\n")).await
            }

            other => {
                let Some(toggle) = Toggle::from_command(other) else {
                    return Ok(());
                };
                let on = self.settings.toggle(id, toggle).await;
                info!(%id, toggle = other, on, "toggle changed");
                if toggle == Toggle::AlwaysOnline && on {
                    let registry = self.registry.clone();
                    let id = id.clone();
                    self.tasks.submit("presence", async move {
                        registry.keepalive(&id).await.map(drop)
                    });
                }
                ctx.reply(&format!("⚙️ {other}: {}", on_off(on))).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_handles_prefix_and_args() {
        assert_eq!(
            parse_command(".setprefix !", "."),
            Some(("setprefix".to_string(), "!".to_string()))
        );
        assert_eq!(
            parse_command("  !Mode   private ", "!"),
            Some(("mode".to_string(), "private".to_string()))
        );
        assert_eq!(
            parse_command(">> ping", ">>"),
            Some(("ping".to_string(), String::new()))
        );
        assert_eq!(parse_command("ping", "."), None);
        assert_eq!(parse_command(".", "."), None);
    }

    #[test]
    fn every_toggle_is_an_owner_command() {
        for t in Toggle::ALL {
            assert!(OWNER_COMMANDS.contains(&t.command()), "{}", t.command());
        }
        assert!(!OWNER_COMMANDS.iter().any(|c| OPEN_COMMANDS.contains(c)));
    }

    #[test]
    fn format_duration_picks_largest_units() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3_725), "1h 2m 5s");
        assert_eq!(format_duration(90_000), "1d 1h 0m");
        assert_eq!(format_duration(-3), "0s");
    }
}
