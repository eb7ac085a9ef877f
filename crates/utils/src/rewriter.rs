//! Header rewriting for forwarded messages.
//!
//! Forwarded mail is sent from our own verified domain, so the original
//! `From` has to be replaced, the original sender is kept reachable through
//! `Reply-To`, and every header that would be invalidated by the rewrite
//! (signatures, bounce addresses, message ids) is dropped. All the rules
//! tolerate folded headers, a line break followed by whitespace is always a
//! continuation of the previous header.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::{address_domain, line_ending, split_message, unfold};

static REPLY_TO: LazyLock<Regex> = LazyLock::new(|| header_regex(r"(?im)^reply-to:"));

static FROM: LazyLock<Regex> =
    LazyLock::new(|| header_regex(r"(?im)^from:[ \t]*([^\r\n]*(?:\r?\n[ \t]+[^\r\n]*)*)"));

static SUBJECT: LazyLock<Regex> = LazyLock::new(|| header_regex(r"(?im)^subject:[ \t]?"));

static TO: LazyLock<Regex> =
    LazyLock::new(|| header_regex(r"(?im)^to:[^\r\n]*(?:\r?\n[ \t]+[^\r\n]*)*"));

static ENVELOPE_FIELDS: LazyLock<Regex> = LazyLock::new(|| {
    header_regex(
        r"(?im)^(?:return-path|sender|message-id):[^\r\n]*(?:\r?\n|\z)(?:[ \t]+[^\r\n]*(?:\r?\n|\z))*",
    )
});

static DKIM_SIGNATURE: LazyLock<Regex> = LazyLock::new(|| {
    header_regex(r"(?im)^dkim-signature:[^\r\n]*(?:\r?\n|\z)(?:[ \t]+[^\r\n]*(?:\r?\n|\z))*")
});

static LIST_UNSUBSCRIBE: LazyLock<Regex> = LazyLock::new(|| {
    header_regex(r"(?im)^list-unsubscribe:[^\r\n]*(?:\r?\n|\z)(?:[ \t]+[^\r\n]*(?:\r?\n|\z))*")
});

static ANGLE_ADDRESS: LazyLock<Regex> = LazyLock::new(|| header_regex(r"<[^<>]*>"));

fn header_regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("Invalid built-in header pattern")
}

/// Static rewrite settings, read once from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HeaderPolicy {
    /// Verified sender address that replaces the address part of `From`.
    #[serde(default)]
    pub from_email: Option<String>,

    /// Prefix prepended to every `Subject` header.
    #[serde(default)]
    pub subject_prefix: Option<String>,

    /// Replacement for every `To` header.
    #[serde(default)]
    pub to_email: Option<String>,

    /// Subscription management settings for `List-Unsubscribe`.
    #[serde(default)]
    pub unsubscribe: Option<UnsubscribePolicy>,
}

impl HeaderPolicy {
    pub fn from_email(&self) -> Option<&str> {
        non_empty(&self.from_email)
    }

    pub fn subject_prefix(&self) -> Option<&str> {
        non_empty(&self.subject_prefix)
    }

    pub fn to_email(&self) -> Option<&str> {
        non_empty(&self.to_email)
    }
}

/// Adds a `List-Unsubscribe` header for aliases living under a
/// subscription-management domain.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UnsubscribePolicy {
    /// Base unsubscribe URL, the alias is appended as the `alias` query parameter.
    pub url: String,

    /// Domain suffix identifying subscription aliases (e.g. `lists.example.com`).
    pub domain: String,
}

impl UnsubscribePolicy {
    /// Tests whether the address lives on the subscription domain or one
    /// of its subdomains.
    pub fn matches(&self, address: &str) -> bool {
        let suffix = self.domain.trim_start_matches(['@', '.']).to_ascii_lowercase();
        if suffix.is_empty() {
            return false;
        }
        match address_domain(address) {
            Some(domain) => {
                let domain = domain.to_ascii_lowercase();
                domain == suffix || domain.ends_with(&format!(".{suffix}"))
            }
            None => false,
        }
    }

    /// Builds the unsubscribe link for an alias.
    pub fn link_for(&self, address: &str) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.url)?;
        url.query_pairs_mut().append_pair("alias", address);
        Ok(url)
    }
}

/// Per-message inputs of a rewrite.
#[derive(Debug, Clone, Copy)]
pub struct RewriteOptions<'a> {
    pub policy: &'a HeaderPolicy,

    /// Primary original recipient, used when no verified sender is set.
    pub original_recipient: &'a str,

    /// Original recipients that resolved to a forwarding target.
    pub aliases: &'a [String],
}

/// Result of a rewrite, the body is passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    pub header: String,
    pub body: String,
}

/// Rewrites the headers of a raw message for forwarding.
///
/// The rules run in a fixed order: `Reply-To` synthesis, `From` rewrite,
/// `Subject` prefix, `To` override, removal of `Return-Path`, `Sender`
/// and `Message-ID`, removal of `DKIM-Signature` blocks and finally the
/// `List-Unsubscribe` header. None of them can fail, a rule that finds
/// nothing to work on leaves the header as it is.
pub fn rewrite(raw: &str, options: &RewriteOptions<'_>) -> Rewritten {
    let (header, body) = split_message(raw);
    let policy = options.policy;
    let eol = if header.is_empty() {
        line_ending(raw)
    } else {
        line_ending(header)
    };
    let mut header = header.to_string();

    if !REPLY_TO.is_match(&header) {
        let from = FROM
            .captures(&header)
            .and_then(|caps| caps.get(1))
            .map(|value| value.as_str().to_string())
            .filter(|value| !value.trim().is_empty());
        match from {
            Some(from) => {
                info!(reply_to = %unfold(&from), "Added Reply-To address");
                append_header(&mut header, "Reply-To", &from, eol);
            }
            None => {
                info!("Reply-To address not added because From address was not properly extracted");
            }
        }
    }

    header = FROM
        .replace_all(&header, |caps: &Captures<'_>| {
            rewrite_from(&unfold(&caps[1]), policy, options.original_recipient)
        })
        .into_owned();

    if let Some(prefix) = policy.subject_prefix() {
        header = SUBJECT
            .replace_all(&header, |_: &Captures<'_>| format!("Subject: {prefix}"))
            .into_owned();
    }

    if let Some(to) = policy.to_email() {
        header = TO
            .replace_all(&header, |_: &Captures<'_>| format!("To: {to}"))
            .into_owned();
    }

    header = ENVELOPE_FIELDS.replace_all(&header, "").into_owned();
    header = DKIM_SIGNATURE.replace_all(&header, "").into_owned();

    if let Some(unsubscribe) = &policy.unsubscribe {
        if let Some(alias) = options.aliases.iter().find(|a| unsubscribe.matches(a)) {
            match unsubscribe.link_for(alias) {
                Ok(link) => {
                    if LIST_UNSUBSCRIBE.is_match(&header) {
                        debug!(alias = %alias, "Replacing existing List-Unsubscribe header");
                        header = LIST_UNSUBSCRIBE.replace_all(&header, "").into_owned();
                    }
                    debug!(alias = %alias, "Adding List-Unsubscribe header");
                    append_header(&mut header, "List-Unsubscribe", &format!("<{link}>"), eol);
                }
                Err(e) => {
                    warn!(url = %unsubscribe.url, error = %e, "Invalid unsubscribe URL");
                }
            }
        }
    }

    Rewritten {
        header,
        body: body.to_string(),
    }
}

fn rewrite_from(value: &str, policy: &HeaderPolicy, original_recipient: &str) -> String {
    match policy.from_email() {
        Some(verified) => {
            let display = display_name(value);
            if display.is_empty() {
                format!("From: <{verified}>")
            } else {
                format!("From: {display} <{verified}>")
            }
        }
        None => {
            let display = value.trim().replacen('<', "at ", 1).replacen('>', "", 1);
            format!("From: {display} <{original_recipient}>")
        }
    }
}

/// Returns the `From` value without its address, only the last angle
/// address is the mailbox, earlier ones belong to the display name.
fn display_name(value: &str) -> String {
    match ANGLE_ADDRESS.find_iter(value).last() {
        Some(address) => {
            let mut display = String::with_capacity(value.len());
            display.push_str(value[..address.start()].trim_end());
            let rest = value[address.end()..].trim();
            if !rest.is_empty() {
                if !display.is_empty() {
                    display.push(' ');
                }
                display.push_str(rest);
            }
            display.trim().to_string()
        }
        None => value.trim().to_string(),
    }
}

fn append_header(header: &mut String, name: &str, value: &str, eol: &str) {
    if !header.is_empty() && !header.ends_with('\n') {
        header.push_str(eol);
    }
    header.push_str(name);
    header.push_str(": ");
    header.push_str(value);
    header.push_str(eol);
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.is_empty())
}
