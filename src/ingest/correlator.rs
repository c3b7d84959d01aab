//! Decides which ticket an inbound message belongs to and who authored it.
//!
//! The ladder: explicit `[#N]` subject tag, then mail thread ancestry, then
//! a fresh ticket. Appending to an existing ticket always requires the
//! sender to resolve to a portal user of that ticket's company, so a
//! spoofed or misdirected reply can never leak into another company's
//! ticket. Messages that match nothing still produce a ticket; unknown
//! senders land under the fallback company for manual triage.

use log::debug;
use uuid::Uuid;

use crate::ingest::store::{IngestRecord, IngestStore, StoreError, TicketTarget};
use crate::parser::ParsedEmail;
use crate::ticketing::{PortalUser, Ticket};

const MAX_TITLE_CHARS: usize = 255;

pub fn correlate(
    store: &dyn IngestStore,
    mailbox_id: Uuid,
    email: &ParsedEmail,
) -> Result<IngestRecord, StoreError> {
    let user = match &email.sender {
        Some(address) => store.user_by_email(address)?,
        None => None,
    };

    if let Some(number) = email.ticket_hint {
        match store.ticket_by_number(number)? {
            Some(ticket) if company_consistent(&ticket, user.as_ref()) => {
                return Ok(append_record(mailbox_id, email, &ticket, user.as_ref()));
            }
            Some(_) => {
                debug!("subject tag #{number} does not match the sender's company, ignoring");
            }
            None => {
                debug!("subject tag #{number} matches no ticket, ignoring");
            }
        }
    }

    for reference in &email.thread_refs {
        if let Some(ticket) = store.ticket_for_message(mailbox_id, reference)? {
            if company_consistent(&ticket, user.as_ref()) {
                return Ok(append_record(mailbox_id, email, &ticket, user.as_ref()));
            }
        }
    }

    let (company_id, triage) = match &user {
        Some(user) => (user.company_id, false),
        None => (store.fallback_company()?.id, true),
    };

    Ok(IngestRecord {
        mailbox_id,
        message_id: email.message_id.clone(),
        target: TicketTarget::New {
            company_id,
            title: ticket_title(&email.subject),
            triage,
        },
        author_id: user.map(|u| u.id),
        author_email: email.sender.clone(),
        body: email.body.clone(),
    })
}

fn company_consistent(ticket: &Ticket, user: Option<&PortalUser>) -> bool {
    user.map(|u| u.company_id == ticket.company_id)
        .unwrap_or(false)
}

fn append_record(
    mailbox_id: Uuid,
    email: &ParsedEmail,
    ticket: &Ticket,
    user: Option<&PortalUser>,
) -> IngestRecord {
    IngestRecord {
        mailbox_id,
        message_id: email.message_id.clone(),
        target: TicketTarget::Existing {
            ticket_id: ticket.id,
        },
        author_id: user.map(|u| u.id),
        author_email: email.sender.clone(),
        body: email.body.clone(),
    }
}

fn ticket_title(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.is_empty() {
        return "(no subject)".to_string();
    }
    trimmed.chars().take(MAX_TITLE_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shared::test_utils::MemoryIngestStore;

    fn email(sender: Option<&str>, subject: &str) -> ParsedEmail {
        ParsedEmail {
            message_id: "msg-1@example.com".to_string(),
            sender: sender.map(str::to_string),
            sender_name: None,
            subject: subject.to_string(),
            body: "hello".to_string(),
            thread_refs: Vec::new(),
            ticket_hint: crate::parser::ticket_hint(subject),
        }
    }

    #[test]
    fn subject_tag_appends_to_matching_company_ticket() {
        let store = MemoryIngestStore::new();
        let company = store.add_company("Acme");
        let user = store.add_user(company, "ana@acme.test");
        let ticket = store.add_ticket(company, 42, "Printer is down");

        let mailbox = Uuid::new_v4();
        let record = correlate(&store, mailbox, &email(Some("ana@acme.test"), "[#42] Re: Printer"))
            .unwrap();

        match record.target {
            TicketTarget::Existing { ticket_id } => assert_eq!(ticket_id, ticket),
            other => panic!("expected append, got {other:?}"),
        }
        assert_eq!(record.author_id, Some(user));
    }

    #[test]
    fn subject_tag_for_foreign_company_opens_a_new_ticket() {
        let store = MemoryIngestStore::new();
        let acme = store.add_company("Acme");
        let globex = store.add_company("Globex");
        store.add_user(acme, "ana@acme.test");
        store.add_ticket(globex, 42, "Globex internal");

        let record = correlate(
            &store,
            Uuid::new_v4(),
            &email(Some("ana@acme.test"), "[#42] sneaky reply"),
        )
        .unwrap();

        match record.target {
            TicketTarget::New {
                company_id, triage, ..
            } => {
                assert_eq!(company_id, acme);
                assert!(!triage);
            }
            other => panic!("expected new ticket, got {other:?}"),
        }
    }

    #[test]
    fn unknown_sender_lands_in_triage_under_the_fallback_company() {
        let store = MemoryIngestStore::new();
        let record = correlate(
            &store,
            Uuid::new_v4(),
            &email(Some("stranger@nowhere.test"), "Help please"),
        )
        .unwrap();

        match record.target {
            TicketTarget::New {
                company_id, triage, ..
            } => {
                assert_eq!(company_id, store.fallback_company_id());
                assert!(triage);
            }
            other => panic!("expected triage ticket, got {other:?}"),
        }
        assert_eq!(record.author_id, None);
        assert_eq!(record.author_email.as_deref(), Some("stranger@nowhere.test"));
    }

    #[test]
    fn thread_reference_appends_when_no_subject_tag() {
        let store = MemoryIngestStore::new();
        let company = store.add_company("Acme");
        store.add_user(company, "ana@acme.test");
        let ticket = store.add_ticket(company, 7, "Slow dashboard");
        let mailbox = Uuid::new_v4();
        store.link_message(mailbox, "root@acme.test", ticket);

        let mut message = email(Some("ana@acme.test"), "Re: Slow dashboard");
        message.thread_refs = vec!["root@acme.test".to_string()];

        let record = correlate(&store, mailbox, &message).unwrap();
        match record.target {
            TicketTarget::Existing { ticket_id } => assert_eq!(ticket_id, ticket),
            other => panic!("expected append, got {other:?}"),
        }
    }

    #[test]
    fn thread_reference_from_unknown_sender_never_appends() {
        let store = MemoryIngestStore::new();
        let company = store.add_company("Acme");
        let ticket = store.add_ticket(company, 7, "Slow dashboard");
        let mailbox = Uuid::new_v4();
        store.link_message(mailbox, "root@acme.test", ticket);

        let mut message = email(Some("stranger@nowhere.test"), "Re: Slow dashboard");
        message.thread_refs = vec!["root@acme.test".to_string()];

        let record = correlate(&store, mailbox, &message).unwrap();
        match record.target {
            TicketTarget::New { triage, .. } => assert!(triage),
            other => panic!("expected triage ticket, got {other:?}"),
        }
    }

    #[test]
    fn unverifiable_tag_still_tries_thread_references() {
        let store = MemoryIngestStore::new();
        let company = store.add_company("Acme");
        store.add_user(company, "ana@acme.test");
        let ticket = store.add_ticket(company, 7, "Slow dashboard");
        let mailbox = Uuid::new_v4();
        store.link_message(mailbox, "root@acme.test", ticket);

        // Tag names a ticket that does not exist; the thread still does.
        let mut message = email(Some("ana@acme.test"), "[#9999] Re: Slow dashboard");
        message.thread_refs = vec!["root@acme.test".to_string()];

        let record = correlate(&store, mailbox, &message).unwrap();
        match record.target {
            TicketTarget::Existing { ticket_id } => assert_eq!(ticket_id, ticket),
            other => panic!("expected append, got {other:?}"),
        }
    }

    #[test]
    fn blank_subject_gets_a_placeholder_title() {
        let store = MemoryIngestStore::new();
        let company = store.add_company("Acme");
        store.add_user(company, "ana@acme.test");

        let record = correlate(&store, Uuid::new_v4(), &email(Some("ana@acme.test"), "   "))
            .unwrap();
        match record.target {
            TicketTarget::New { title, .. } => assert_eq!(title, "(no subject)"),
            other => panic!("expected new ticket, got {other:?}"),
        }
    }

    #[test]
    fn overlong_subject_is_truncated_on_a_character_boundary() {
        let store = MemoryIngestStore::new();
        let company = store.add_company("Acme");
        store.add_user(company, "ana@acme.test");

        let subject = "ticker".repeat(100);
        let record = correlate(&store, Uuid::new_v4(), &email(Some("ana@acme.test"), &subject))
            .unwrap();
        match record.target {
            TicketTarget::New { title, .. } => assert_eq!(title.chars().count(), MAX_TITLE_CHARS),
            other => panic!("expected new ticket, got {other:?}"),
        }
    }
}
