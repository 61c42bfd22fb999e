diesel::table! {
    stock_ledger (id) {
        id -> Uuid,
        item_id -> Uuid,
        sku -> Nullable<Varchar>,
        name -> Varchar,
        category -> Nullable<Varchar>,
        brand -> Nullable<Varchar>,
        item_type -> Nullable<Varchar>,
        base_price -> Nullable<Numeric>,
        daily_rate -> Nullable<Numeric>,
        description -> Nullable<Text>,
        available_quantity -> Int4,
        reserved_quantity -> Int4,
        pending_reservations -> Int4,
        version -> Int8,
        is_active -> Bool,
        is_rental_available -> Bool,
        last_synced_at -> Nullable<Timestamptz>,
        retired_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        reservation_id -> Varchar,
        item_id -> Uuid,
        customer_id -> Uuid,
        quantity -> Int4,
        status -> Varchar,
        planned_start -> Nullable<Timestamptz>,
        planned_end -> Nullable<Timestamptz>,
        expires_at -> Timestamptz,
        notes -> Nullable<Text>,
        confirmed_at -> Nullable<Timestamptz>,
        cancelled_at -> Nullable<Timestamptz>,
        expired_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    processed_commands (idempotency_key) {
        idempotency_key -> Varchar,
        command_id -> Uuid,
        result -> Nullable<Jsonb>,
        processed_at -> Nullable<Timestamptz>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    processed_commands,
    reservations,
    stock_ledger,
);
