#[cfg(test)]
mod ingest_flow_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::broadcast;

    use mailroom::connector::{ConnectorError, FetchFailure, FetchedBatch, FetchedMessage};
    use mailroom::core::shared::enums::{AuditCode, AuditLevel};
    use mailroom::core::shared::test_utils::{
        raw_email, sample_config, MemoryIngestStore, RecordingAuditLog, ScriptedMailSource,
    };
    use mailroom::ingest::IngestPipeline;
    use mailroom::notify::{activity_channel, ActivityKind, TicketActivity};

    struct Harness {
        source: Arc<ScriptedMailSource>,
        store: Arc<MemoryIngestStore>,
        audit: Arc<RecordingAuditLog>,
        pipeline: IngestPipeline,
        activity: broadcast::Receiver<TicketActivity>,
    }

    fn harness_with_budget(budget: Duration) -> Harness {
        let source = Arc::new(ScriptedMailSource::new());
        let store = Arc::new(MemoryIngestStore::new());
        let audit = Arc::new(RecordingAuditLog::new());
        let (activity_tx, activity) = activity_channel();
        let pipeline = IngestPipeline::new(
            source.clone(),
            store.clone(),
            audit.clone(),
            activity_tx,
            budget,
        );
        Harness {
            source,
            store,
            audit,
            pipeline,
            activity,
        }
    }

    fn harness() -> Harness {
        harness_with_budget(Duration::from_secs(5))
    }

    fn message(uid: u32, message_id: &str, from: &str, subject: &str, body: &str) -> FetchedMessage {
        FetchedMessage {
            uid,
            raw: raw_email(message_id, from, subject, body),
        }
    }

    /// Like [`raw_email`] but threading onto an earlier message.
    fn raw_reply(
        message_id: &str,
        from: &str,
        subject: &str,
        in_reply_to: &str,
        body: &str,
    ) -> Vec<u8> {
        format!(
            "Message-ID: {message_id}\r\n\
             In-Reply-To: {in_reply_to}\r\n\
             References: {in_reply_to}\r\n\
             From: {from}\r\n\
             To: support@example.test\r\n\
             Subject: {subject}\r\n\
             Date: Mon, 5 May 2025 11:00:00 +0000\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             \r\n\
             {body}\r\n"
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn fresh_message_creates_a_ticket_and_flags_it_seen() {
        let mut h = harness();
        let company = h.store.add_company("Acme");
        let user = h.store.add_user(company, "ana@acme.test");
        let config = sample_config("support");

        h.source.script_messages(
            config.id,
            vec![message(
                11,
                "<m1@acme.test>",
                "Ana <ana@acme.test>",
                "Printer down",
                "It stopped printing entirely.",
            )],
        );

        let outcome = h.pipeline.run_cycle(&config).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.stats.ingested, 1);
        assert_eq!(outcome.stats.tickets_created, 1);

        let tickets = h.store.tickets();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].number, 1);
        assert_eq!(tickets[0].company_id, company);
        assert_eq!(tickets[0].status, "open");
        assert_eq!(tickets[0].title, "Printer down");

        let messages = h.store.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].author_id, Some(user));
        assert!(!messages[0].is_system);
        assert!(!messages[0].is_internal);
        assert_eq!(messages[0].content, "It stopped printing entirely.");

        assert_eq!(h.source.seen_uids(config.id), vec![11]);

        let event = h.activity.try_recv().expect("activity event");
        assert_eq!(event.kind, ActivityKind::Created);
        assert_eq!(event.ticket_number, 1);
        assert_eq!(event.mailbox_id, config.id);
    }

    #[tokio::test]
    async fn subject_tag_reply_appends_instead_of_creating() {
        let mut h = harness();
        let company = h.store.add_company("Acme");
        h.store.add_user(company, "ana@acme.test");
        let ticket = h.store.add_ticket(company, 42, "Printer down");
        let config = sample_config("support");

        h.source.script_messages(
            config.id,
            vec![message(
                5,
                "<m2@acme.test>",
                "ana@acme.test",
                "[#42] Re: Printer down",
                "Still broken after the restart.",
            )],
        );

        let outcome = h.pipeline.run_cycle(&config).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.stats.ingested, 1);
        assert_eq!(outcome.stats.tickets_created, 0);

        assert_eq!(h.store.tickets().len(), 1);
        let messages = h.store.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].ticket_id, ticket);

        let event = h.activity.try_recv().expect("activity event");
        assert_eq!(event.kind, ActivityKind::Replied);
        assert_eq!(event.ticket_number, 42);
    }

    #[tokio::test]
    async fn in_reply_to_threads_onto_the_original_ticket() {
        let h = harness();
        let company = h.store.add_company("Acme");
        h.store.add_user(company, "ana@acme.test");
        let config = sample_config("support");

        h.source.script_messages(
            config.id,
            vec![message(
                1,
                "<m1@acme.test>",
                "ana@acme.test",
                "Printer down",
                "It broke.",
            )],
        );
        let first = h.pipeline.run_cycle(&config).await;
        assert_eq!(first.stats.tickets_created, 1);

        h.source.script_messages(
            config.id,
            vec![FetchedMessage {
                uid: 2,
                raw: raw_reply(
                    "<m2@acme.test>",
                    "ana@acme.test",
                    "Re: Printer down",
                    "<m1@acme.test>",
                    "Adding a photo of the jam.",
                ),
            }],
        );
        let second = h.pipeline.run_cycle(&config).await;
        assert!(second.is_success());
        assert_eq!(second.stats.ingested, 1);
        assert_eq!(second.stats.tickets_created, 0);

        let tickets = h.store.tickets();
        assert_eq!(tickets.len(), 1);
        let messages = h.store.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.ticket_id == tickets[0].id));
    }

    #[tokio::test]
    async fn unknown_sender_is_filed_for_triage_not_dropped() {
        let h = harness();
        let config = sample_config("support");

        h.source.script_messages(
            config.id,
            vec![message(
                3,
                "<m3@elsewhere.test>",
                "Someone <stranger@elsewhere.test>",
                "Password reset?",
                "I cannot log in.",
            )],
        );

        let outcome = h.pipeline.run_cycle(&config).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.stats.ingested, 1);

        let tickets = h.store.tickets();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].status, "triage");
        assert_eq!(tickets[0].company_id, h.store.fallback_company_id());

        let messages = h.store.messages();
        assert_eq!(messages[0].author_id, None);
        assert!(messages[0].is_system);
        assert!(!messages[0].is_internal);
        assert_eq!(
            messages[0].author_email.as_deref(),
            Some("stranger@elsewhere.test")
        );
    }

    #[tokio::test]
    async fn refetched_message_is_skipped_without_a_second_write() {
        let h = harness();
        let company = h.store.add_company("Acme");
        h.store.add_user(company, "ana@acme.test");
        let config = sample_config("support");

        let raw = || {
            message(
                4,
                "<m4@acme.test>",
                "ana@acme.test",
                "Printer down",
                "It broke.",
            )
        };
        h.source.script_messages(config.id, vec![raw()]);
        h.pipeline.run_cycle(&config).await;

        // Same message shows up again, as after a seen-flag failure.
        h.source.script_messages(config.id, vec![raw()]);
        let second = h.pipeline.run_cycle(&config).await;

        assert!(second.is_success());
        assert_eq!(second.stats.duplicates, 1);
        assert_eq!(second.stats.ingested, 0);
        assert_eq!(h.store.tickets().len(), 1);
        assert_eq!(h.store.messages().len(), 1);
        // Flagged seen in both cycles; the duplicate is disposed of too.
        assert_eq!(h.source.seen_uids(config.id), vec![4, 4]);
        // Dedup skips are routine, never audited above info.
        assert!(h
            .audit
            .entries()
            .iter()
            .all(|e| e.level == AuditLevel::Info));
    }

    #[tokio::test]
    async fn same_message_sent_to_two_mailboxes_is_ingested_in_each() {
        let h = harness();
        let company = h.store.add_company("Acme");
        h.store.add_user(company, "ana@acme.test");
        let support = sample_config("support");
        let billing = sample_config("billing");

        let copy = |uid| {
            message(
                uid,
                "<cross@acme.test>",
                "ana@acme.test",
                "Sent to both addresses",
                "CCing billing so someone answers.",
            )
        };
        h.source.script_messages(support.id, vec![copy(31)]);
        h.source.script_messages(billing.id, vec![copy(8)]);

        let first = h.pipeline.run_cycle(&support).await;
        let second = h.pipeline.run_cycle(&billing).await;

        // The dedup key is (mailbox, message id), so the second mailbox
        // files its own copy instead of skipping it.
        assert_eq!(first.stats.ingested, 1);
        assert_eq!(second.stats.ingested, 1);
        assert_eq!(second.stats.duplicates, 0);
        assert_eq!(h.store.tickets().len(), 2);
        assert_eq!(h.store.messages().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_message_id_within_one_batch_writes_once() {
        let h = harness();
        let company = h.store.add_company("Acme");
        h.store.add_user(company, "ana@acme.test");
        let config = sample_config("support");

        // A resend can land next to the original inside one UNSEEN window.
        let copy = |uid| {
            message(
                uid,
                "<m21@acme.test>",
                "ana@acme.test",
                "Printer down",
                "It broke.",
            )
        };
        h.source.script_messages(config.id, vec![copy(21), copy(22)]);

        let outcome = h.pipeline.run_cycle(&config).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.stats.ingested, 1);
        assert_eq!(outcome.stats.duplicates, 1);
        assert_eq!(outcome.stats.tickets_created, 1);
        assert_eq!(h.store.tickets().len(), 1);
        assert_eq!(h.store.messages().len(), 1);
        // Both copies are disposed of.
        assert_eq!(h.source.seen_uids(config.id), vec![21, 22]);
    }

    #[tokio::test]
    async fn storage_failure_leaves_the_message_unseen_for_retry() {
        let h = harness();
        let company = h.store.add_company("Acme");
        h.store.add_user(company, "ana@acme.test");
        let config = sample_config("support");

        let raw = || {
            message(
                6,
                "<m6@acme.test>",
                "ana@acme.test",
                "Printer down",
                "It broke.",
            )
        };
        h.store.fail_writes(true);
        h.source.script_messages(config.id, vec![raw()]);
        let first = h.pipeline.run_cycle(&config).await;

        // A per-message write failure does not fail the cycle itself.
        assert!(first.is_success());
        assert_eq!(first.stats.storage_failures, 1);
        assert_eq!(first.stats.ingested, 0);
        assert!(h.source.seen_uids(config.id).is_empty());
        assert!(h.audit.entries().iter().any(|e| {
            e.level == AuditLevel::Warning && e.code == Some(AuditCode::StorageFailed)
        }));

        h.store.fail_writes(false);
        h.source.script_messages(config.id, vec![raw()]);
        let second = h.pipeline.run_cycle(&config).await;
        assert_eq!(second.stats.ingested, 1);
        assert_eq!(h.store.tickets().len(), 1);
        assert_eq!(h.source.seen_uids(config.id), vec![6]);
    }

    #[tokio::test]
    async fn unparseable_message_is_audited_and_not_retried() {
        let h = harness();
        let config = sample_config("support");

        h.source.script_messages(
            config.id,
            vec![FetchedMessage {
                uid: 9,
                raw: b"\r\n\r\nnot really an email".to_vec(),
            }],
        );

        let outcome = h.pipeline.run_cycle(&config).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.stats.parse_failures, 1);
        assert_eq!(outcome.stats.ingested, 0);
        // No dedup key will ever exist for it, so it is disposed of now.
        assert_eq!(h.source.seen_uids(config.id), vec![9]);
        assert!(h.audit.entries().iter().any(|e| {
            e.level == AuditLevel::Warning && e.code == Some(AuditCode::ParseFailed)
        }));
    }

    #[tokio::test]
    async fn per_message_fetch_failures_do_not_fail_the_cycle() {
        let h = harness();
        let company = h.store.add_company("Acme");
        h.store.add_user(company, "ana@acme.test");
        let config = sample_config("support");

        h.source.script(
            config.id,
            Ok(FetchedBatch {
                messages: vec![message(
                    12,
                    "<m12@acme.test>",
                    "ana@acme.test",
                    "Printer down",
                    "It broke.",
                )],
                failures: vec![FetchFailure {
                    uid: 13,
                    reason: "server closed the connection".to_string(),
                }],
            }),
        );

        let outcome = h.pipeline.run_cycle(&config).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.stats.ingested, 1);
        assert_eq!(outcome.stats.fetch_failures, 1);
        assert!(h.audit.entries().iter().any(|e| {
            e.level == AuditLevel::Warning && e.code == Some(AuditCode::FetchFailed)
        }));
    }

    #[tokio::test]
    async fn auth_failure_is_fatal_and_audited() {
        let h = harness();
        let config = sample_config("support");

        h.source.script(
            config.id,
            Err(ConnectorError::Auth("LOGIN rejected".to_string())),
        );

        let outcome = h.pipeline.run_cycle(&config).await;
        assert!(!outcome.is_success());

        let entries = h.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, AuditLevel::Error);
        assert_eq!(entries[0].code, Some(AuditCode::AuthFailed));
        assert_eq!(entries[0].mailbox_id, config.id);
    }

    #[tokio::test]
    async fn slow_fetch_trips_the_cycle_budget() {
        let h = harness_with_budget(Duration::from_millis(50));
        let config = sample_config("support");

        h.source.set_delay(config.id, Duration::from_millis(300));
        h.source.script_messages(config.id, Vec::new());

        let outcome = h.pipeline.run_cycle(&config).await;
        assert!(!outcome.is_success());
        assert!(h.audit.entries().iter().any(|e| {
            e.level == AuditLevel::Error && e.code == Some(AuditCode::Timeout)
        }));
    }

    #[tokio::test]
    async fn every_successful_cycle_writes_an_info_summary() {
        let h = harness();
        let config = sample_config("support");

        let outcome = h.pipeline.run_cycle(&config).await;
        assert!(outcome.is_success());

        let entries = h.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, AuditLevel::Info);
        assert_eq!(entries[0].code, None);
        assert!(entries[0].message.contains("cycle completed"));
    }
}
