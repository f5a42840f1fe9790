diesel::table! {
    stock_records (id) {
        id -> Uuid,
        product_id -> Uuid,
        warehouse -> Varchar,
        on_hand -> Int4,
        reserved -> Int4,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        product_id -> Uuid,
        warehouse -> Varchar,
        quantity -> Int4,
        order_id -> Uuid,
        idempotency_key -> Varchar,
        status -> Varchar,
        reserved_at -> Timestamptz,
        expires_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(stock_records, reservations,);
