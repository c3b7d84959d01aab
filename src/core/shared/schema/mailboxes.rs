diesel::table! {
    mailbox_configs (id) {
        id -> Uuid,
        name -> Varchar,
        address -> Varchar,
        imap_host -> Varchar,
        imap_port -> Int4,
        imap_tls -> Bool,
        smtp_host -> Varchar,
        smtp_port -> Int4,
        smtp_tls -> Bool,
        username -> Varchar,
        password_encrypted -> Text,
        is_active -> Bool,
        poll_interval_minutes -> Int4,
        last_polled_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    ingested_messages (id) {
        id -> Uuid,
        mailbox_id -> Uuid,
        message_id -> Varchar,
        ingested_at -> Timestamptz,
        ticket_id -> Nullable<Uuid>,
    }
}

diesel::table! {
    mailbox_audit_log (id) {
        id -> Uuid,
        mailbox_id -> Uuid,
        level -> SmallInt,
        code -> Nullable<SmallInt>,
        message -> Text,
        created_at -> Timestamptz,
    }
}
