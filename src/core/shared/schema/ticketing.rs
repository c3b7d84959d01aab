diesel::table! {
    companies (id) {
        id -> Uuid,
        name -> Varchar,
        is_fallback -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    portal_users (id) {
        id -> Uuid,
        company_id -> Uuid,
        email -> Varchar,
        display_name -> Varchar,
        is_active -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    tickets (id) {
        id -> Uuid,
        number -> Int8,
        company_id -> Uuid,
        title -> Varchar,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_messages (id) {
        id -> Uuid,
        ticket_id -> Uuid,
        author_id -> Nullable<Uuid>,
        author_email -> Nullable<Varchar>,
        content -> Text,
        is_system -> Bool,
        is_internal -> Bool,
        created_at -> Timestamptz,
    }
}
