//! `From` header parsing and reply subjects.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::AddressError;

static ADDR_SPEC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^[^\s@<>(),;:"\[\]]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$"#)
        .unwrap()
});

/// A single mailbox from a header such as `"Jane Doe" <jane@example.com>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    pub display_name: Option<String>,
    pub address: String,
}

impl EmailAddress {
    /// Parse one mailbox. Accepts a bare address or `Name <address>`.
    pub fn parse(header: &str) -> Result<Self, AddressError> {
        let header = header.trim();
        if header.is_empty() {
            return Err(AddressError::Empty);
        }

        let (display_name, address) = match header.find('<') {
            Some(open) => {
                let close = header[open..]
                    .find('>')
                    .map(|i| open + i)
                    .ok_or_else(|| AddressError::Unterminated(header.to_string()))?;
                let name = header[..open].trim().trim_matches('"').trim();
                let name = (!name.is_empty()).then(|| name.to_string());
                (name, header[open + 1..close].trim())
            }
            None => (None, header),
        };

        if !ADDR_SPEC.is_match(address) {
            return Err(AddressError::Invalid(address.to_string()));
        }
        Ok(Self {
            display_name,
            address: address.to_string(),
        })
    }

    /// Case-insensitive comparison of the address part only.
    pub fn same_mailbox(&self, other: &str) -> bool {
        self.address.eq_ignore_ascii_case(other.trim())
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{name} <{}>", self.address),
            None => f.write_str(&self.address),
        }
    }
}

/// `Re: <subject>`, without stacking prefixes on an existing reply.
pub fn reply_subject(subject: &str) -> String {
    let subject = subject.trim();
    let already_reply = subject
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("re:"));
    if already_reply {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_address() {
        let addr = EmailAddress::parse("Jane Doe <jane@example.com>").unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Jane Doe"));
        assert_eq!(addr.address, "jane@example.com");
    }

    #[test]
    fn parses_quoted_name() {
        let addr = EmailAddress::parse(r#""Doe, Jane" <jane@example.com>"#).unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Doe, Jane"));
    }

    #[test]
    fn parses_bare_address() {
        let addr = EmailAddress::parse("  bob+repairs@shop.co.uk ").unwrap();
        assert_eq!(addr.display_name, None);
        assert_eq!(addr.address, "bob+repairs@shop.co.uk");
    }

    #[test]
    fn angle_brackets_without_name() {
        let addr = EmailAddress::parse("<a@b.io>").unwrap();
        assert_eq!(addr.display_name, None);
        assert_eq!(addr.address, "a@b.io");
    }

    #[test]
    fn empty_header_is_error() {
        assert_eq!(EmailAddress::parse("   "), Err(AddressError::Empty));
    }

    #[test]
    fn unterminated_bracket_is_error() {
        assert!(matches!(
            EmailAddress::parse("Jane <jane@example.com"),
            Err(AddressError::Unterminated(_))
        ));
    }

    #[test]
    fn invalid_addresses_are_rejected() {
        for bad in ["Jane Doe", "not-an-email", "a@b", "<@example.com>", "x y@example.com"] {
            assert!(
                matches!(EmailAddress::parse(bad), Err(AddressError::Invalid(_))),
                "{bad} should be invalid"
            );
        }
    }

    #[test]
    fn display_round_trips_name() {
        let addr = EmailAddress::parse("Jane <jane@example.com>").unwrap();
        assert_eq!(addr.to_string(), "Jane <jane@example.com>");
    }

    #[test]
    fn same_mailbox_ignores_case() {
        let addr = EmailAddress::parse("Shop <Shop@Example.com>").unwrap();
        assert!(addr.same_mailbox("shop@example.com"));
        assert!(!addr.same_mailbox("other@example.com"));
    }

    #[test]
    fn reply_subject_adds_prefix_once() {
        assert_eq!(reply_subject("Screen repair quote"), "Re: Screen repair quote");
        assert_eq!(reply_subject("RE: Screen repair quote"), "RE: Screen repair quote");
        assert_eq!(reply_subject(""), "Re: ");
    }
}
