use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::services::session::UserBadges;

/// One raw IRC line split into its parts, borrowing from the input.
#[derive(Debug, Default)]
pub struct IrcMessage<'a> {
    tags: Option<&'a str>,
    prefix: Option<&'a str>,
    command: Option<&'a str>,
    params: Vec<&'a str>,
}

impl<'a> IrcMessage<'a> {
    pub fn command(&self) -> Option<&str> {
        self.command
    }

    pub fn params(&self) -> &[&str] {
        &self.params
    }

    pub fn parse(line: &'a str) -> Self {
        let mut message = IrcMessage::default();
        let mut remainder = line.trim_end_matches(['\r', '\n']);

        if let Some(rest) = remainder.strip_prefix('@') {
            match rest.find(' ') {
                Some(idx) => {
                    message.tags = Some(&rest[..idx]);
                    remainder = &rest[idx + 1..];
                }
                None => {
                    message.tags = Some(rest);
                    return message;
                }
            }
        }
        if let Some(rest) = remainder.strip_prefix(':') {
            match rest.find(' ') {
                Some(idx) => {
                    message.prefix = Some(&rest[..idx]);
                    remainder = &rest[idx + 1..];
                }
                None => {
                    message.prefix = Some(rest);
                    return message;
                }
            }
        }

        let (head, trailing) = match remainder.find(" :") {
            Some(idx) => (&remainder[..idx], Some(&remainder[idx + 2..])),
            None => (remainder, None),
        };
        let mut parts = head.split(' ').filter(|s| !s.is_empty());
        message.command = parts.next();
        message.params.extend(parts);
        if let Some(t) = trailing {
            message.params.push(t);
        }
        message
    }

    pub fn tag(&self, key: &str) -> Option<&'a str> {
        self.tags.and_then(|tags| {
            tags.split(';').find_map(|component| {
                let mut parts = component.splitn(2, '=');
                (parts.next()? == key).then(|| parts.next().unwrap_or(""))
            })
        })
    }

    fn prefix_nick(&self) -> Option<&'a str> {
        self.prefix.and_then(|p| p.split('!').next())
    }

    fn badges(&self) -> UserBadges {
        let badges = self.tag("badges").unwrap_or("");
        let has = |name: &str| {
            badges
                .split(',')
                .any(|b| b.split('/').next() == Some(name))
        };
        UserBadges {
            broadcaster: has("broadcaster"),
            moderator: self.tag("mod") == Some("1") || has("moderator"),
            vip: self.tag("vip") == Some("1") || has("vip"),
            subscriber: self.tag("subscriber") == Some("1")
                || has("subscriber")
                || has("founder"),
        }
    }

    /// Convert a PRIVMSG into a chat message; other commands yield `None`.
    pub fn to_chat_message(&self) -> Option<ChatMessage> {
        if self.command != Some("PRIVMSG") || self.params.len() < 2 {
            return None;
        }
        let channel = self.params.first()?.trim_start_matches('#').to_string();
        let text = self
            .params
            .last()?
            .trim_end_matches(|c: char| c.is_whitespace() || c == '\u{E0000}' || c == '\u{200B}')
            .trim_start()
            .to_string();

        let user_login = self
            .tag("login")
            .filter(|s| !s.is_empty())
            .or_else(|| self.prefix_nick())?
            .to_lowercase();
        let display_name = self
            .tag("display-name")
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| user_login.clone());

        Some(ChatMessage {
            channel,
            user_login,
            display_name,
            user_id: self.tag("user-id").map(str::to_string),
            message_id: self.tag("id").map(str::to_string),
            text,
            badges: self.badges(),
            bits: self
                .tag("bits")
                .and_then(|b| b.parse::<u64>().ok())
                .filter(|b| *b > 0),
            timestamp: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub channel: String,
    pub user_login: String,
    pub display_name: String,
    pub user_id: Option<String>,
    pub message_id: Option<String>,
    pub text: String,
    #[serde(skip)]
    pub badges: UserBadges,
    pub bits: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVMSG: &str = "@badge-info=subscriber/8;badges=vip/1,subscriber/6;bits=250;color=#FF0000;display-name=CoolViewer;id=abc-1;mod=0;subscriber=1;user-id=777 :coolviewer!coolviewer@coolviewer.tmi.twitch.tv PRIVMSG #streamer :Cheer250 nice stream!\r\n";

    #[test]
    fn parses_tags_prefix_command_and_params() {
        let msg = IrcMessage::parse(PRIVMSG);
        assert_eq!(msg.command(), Some("PRIVMSG"));
        assert_eq!(msg.params(), &["#streamer", "Cheer250 nice stream!"]);
        assert_eq!(msg.tag("user-id"), Some("777"));
        assert_eq!(msg.tag("missing"), None);
    }

    #[test]
    fn privmsg_becomes_chat_message_with_badges_and_bits() {
        let chat = IrcMessage::parse(PRIVMSG).to_chat_message().unwrap();
        assert_eq!(chat.channel, "streamer");
        assert_eq!(chat.user_login, "coolviewer");
        assert_eq!(chat.display_name, "CoolViewer");
        assert_eq!(chat.text, "Cheer250 nice stream!");
        assert_eq!(chat.bits, Some(250));
        assert!(chat.badges.vip);
        assert!(chat.badges.subscriber);
        assert!(!chat.badges.moderator);
    }

    #[test]
    fn moderator_and_broadcaster_badges() {
        let line = "@badges=broadcaster/1;mod=0 :me!me@me.tmi.twitch.tv PRIVMSG #me :!hello";
        let chat = IrcMessage::parse(line).to_chat_message().unwrap();
        assert!(chat.badges.broadcaster);
        assert!(!chat.badges.vip);

        let line = "@badges=moderator/1;mod=1 :m!m@m PRIVMSG #me :hi";
        assert!(IrcMessage::parse(line).to_chat_message().unwrap().badges.moderator);
    }

    #[test]
    fn non_privmsg_lines_are_not_chat() {
        let ping = IrcMessage::parse("PING :tmi.twitch.tv");
        assert_eq!(ping.command(), Some("PING"));
        assert_eq!(ping.params(), &["tmi.twitch.tv"]);
        assert!(ping.to_chat_message().is_none());

        let join = IrcMessage::parse(":me!me@me.tmi.twitch.tv JOIN #me");
        assert!(join.to_chat_message().is_none());
    }
}
