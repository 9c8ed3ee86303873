// Transport selection: which contacts of a peer get the packet

use crate::identity::Contact;
use crate::transport::Protocol;
use std::collections::HashSet;

/// What the gateway knows about its own transports and the peer.
pub struct Selection<'a> {
    pub contacts: &'a [Contact],
    /// Protocols that recently delivered to this peer, most recent first.
    pub working: &'a [Protocol],
    pub priority: &'a [Protocol],
    pub excluded: &'a HashSet<Protocol>,
    /// Installed, listening and enabled for sending.
    pub can_send: &'a dyn Fn(Protocol) -> bool,
    /// Installed and listening.
    pub is_listening: &'a dyn Fn(Protocol) -> bool,
}

impl<'a> Selection<'a> {
    fn usable(&self, proto: Protocol) -> bool {
        !self.excluded.contains(&proto) && (self.can_send)(proto)
    }

    fn contact(&self, proto: Protocol) -> Option<&'a Contact> {
        self.contacts.iter().find(|c| c.proto == proto)
    }

    /// Every usable contact, for wide sends.
    pub fn all(&self) -> Vec<Contact> {
        let mut picked: Vec<Contact> = Vec::new();
        for contact in self.contacts {
            if self.usable(contact.proto) && !picked.contains(contact) {
                picked.push(contact.clone());
            }
        }
        picked
    }

    /// One contact: a protocol that worked lately, then the configured
    /// priority, then the first declared contact we can listen on.
    pub fn best(&self) -> Option<Contact> {
        for proto in self.working.iter().chain(self.priority.iter()) {
            if self.usable(*proto) {
                if let Some(contact) = self.contact(*proto) {
                    return Some(contact.clone());
                }
            }
        }
        self.contacts
            .iter()
            .find(|c| !self.excluded.contains(&c.proto) && (self.is_listening)(c.proto))
            .cloned()
    }

    pub fn pick(&self, wide: bool) -> Vec<Contact> {
        if wide {
            self.all()
        } else {
            self.best().into_iter().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contacts() -> Vec<Contact> {
        vec![
            Contact::new(Protocol::Http, "h:80"),
            Contact::new(Protocol::Udp, "u:1"),
            Contact::new(Protocol::Tcp, "t:1"),
        ]
    }

    fn everything(_: Protocol) -> bool {
        true
    }

    #[test]
    fn test_working_protocol_wins() {
        let contacts = contacts();
        let excluded = HashSet::new();
        let selection = Selection {
            contacts: &contacts,
            working: &[Protocol::Udp],
            priority: &Protocol::PRIORITY,
            excluded: &excluded,
            can_send: &everything,
            is_listening: &everything,
        };
        assert_eq!(selection.pick(false), vec![Contact::new(Protocol::Udp, "u:1")]);
    }

    #[test]
    fn test_priority_then_first_listening() {
        let contacts = contacts();
        let excluded = HashSet::new();
        let selection = Selection {
            contacts: &contacts,
            working: &[],
            priority: &Protocol::PRIORITY,
            excluded: &excluded,
            can_send: &everything,
            is_listening: &everything,
        };
        assert_eq!(selection.best(), Some(Contact::new(Protocol::Tcp, "t:1")));

        // sending disabled everywhere: fall back to the first listening contact
        let nothing = |_: Protocol| false;
        let selection = Selection {
            can_send: &nothing,
            ..selection
        };
        assert_eq!(selection.best(), Some(Contact::new(Protocol::Http, "h:80")));
    }

    #[test]
    fn test_wide_skips_excluded_and_disabled() {
        let contacts = contacts();
        let excluded: HashSet<Protocol> = [Protocol::Tcp].into_iter().collect();
        let no_udp = |p: Protocol| p != Protocol::Udp;
        let selection = Selection {
            contacts: &contacts,
            working: &[],
            priority: &Protocol::PRIORITY,
            excluded: &excluded,
            can_send: &no_udp,
            is_listening: &everything,
        };
        assert_eq!(selection.pick(true), vec![Contact::new(Protocol::Http, "h:80")]);
    }

    #[test]
    fn test_nothing_usable() {
        let contacts = contacts();
        let excluded: HashSet<Protocol> = Protocol::PRIORITY.into_iter().collect();
        let selection = Selection {
            contacts: &contacts,
            working: &[],
            priority: &Protocol::PRIORITY,
            excluded: &excluded,
            can_send: &everything,
            is_listening: &everything,
        };
        assert!(selection.pick(false).is_empty());
        assert!(selection.pick(true).is_empty());
    }
}
