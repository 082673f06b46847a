use diesel::{allow_tables_to_appear_in_same_query, table};

table! {
    profiles (id) {
        id -> Text,
        email -> Text,
        user_type -> Text,
        first_name -> Nullable<Text>,
        last_name -> Nullable<Text>,
        company_name -> Nullable<Text>,
        phone -> Nullable<Text>,
        coin_balance -> BigInt,
        kyc_status -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    requirements (id) {
        id -> Text,
        buyer_id -> Text,
        property_type -> Text,
        location -> Nullable<Text>,
        budget_min -> Nullable<BigInt>,
        budget_max -> Nullable<BigInt>,
        area_min -> Nullable<Integer>,
        area_max -> Nullable<Integer>,
        bedrooms -> Nullable<Integer>,
        urgency -> Text,
        notes -> Nullable<Text>,
        status -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    property_approvals (id) {
        id -> Text,
        broker_id -> Text,
        draft -> Jsonb,
        status -> Text,
        reviewer_notes -> Nullable<Text>,
        property_id -> Nullable<Text>,
        created_at -> Timestamptz,
        reviewed_at -> Nullable<Timestamptz>,
    }
}

table! {
    properties (id) {
        id -> Text,
        broker_id -> Text,
        approval_id -> Text,
        title -> Text,
        property_type -> Text,
        location -> Text,
        price -> BigInt,
        area -> Nullable<Integer>,
        bedrooms -> Nullable<Integer>,
        description -> Nullable<Text>,
        status -> Text,
        user_status -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    property_matches (id) {
        id -> Text,
        broker_id -> Text,
        buyer_id -> Text,
        property_id -> Text,
        requirement_id -> Text,
        match_score -> Integer,
        is_lead_purchased -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    leads (id) {
        id -> Text,
        match_id -> Text,
        broker_id -> Text,
        buyer_id -> Text,
        property_id -> Text,
        requirement_id -> Text,
        lead_price -> BigInt,
        status -> Text,
        rejection_reason -> Nullable<Text>,
        chat_id -> Nullable<Text>,
        created_at -> Timestamptz,
        decided_at -> Nullable<Timestamptz>,
    }
}

table! {
    wallet_transactions (id) {
        id -> Text,
        user_id -> Text,
        amount -> BigInt,
        tx_type -> Text,
        reference_id -> Nullable<Text>,
        description -> Nullable<Text>,
        balance_after -> BigInt,
        created_at -> Timestamptz,
    }
}

table! {
    chats (id) {
        id -> Text,
        lead_id -> Nullable<Text>,
        broker_id -> Text,
        buyer_id -> Text,
        is_active -> Bool,
        last_message_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

table! {
    messages (id) {
        id -> Text,
        chat_id -> Text,
        sender_id -> Text,
        content -> Text,
        created_at -> Timestamptz,
    }
}

table! {
    market_outbox (id) {
        id -> BigInt,
        table_name -> Text,
        change_kind -> Text,
        record -> Jsonb,
        old_record -> Nullable<Jsonb>,
        created_at -> Timestamptz,
        processed_at -> Nullable<Timestamptz>,
        published_at -> Nullable<Timestamptz>,
        retry_count -> Integer,
        error_message -> Nullable<Text>,
    }
}

allow_tables_to_appear_in_same_query!(
    profiles,
    requirements,
    property_approvals,
    properties,
    property_matches,
    leads,
    wallet_transactions,
    chats,
    messages,
    market_outbox,
);
