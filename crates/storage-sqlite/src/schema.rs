//! Table definitions for the metadata store.

diesel::table! {
    users (user_id) {
        user_id -> BigInt,
        name -> Text,
        account -> Text,
        profile_image_url -> Text,
        is_premium -> Nullable<Bool>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    illusts (illust_id) {
        illust_id -> BigInt,
        user_id -> BigInt,
        title -> Text,
        caption -> Text,
        create_date -> Text,
        page_count -> Integer,
        width -> Integer,
        height -> Integer,
        bookmark_count -> BigInt,
        view_count -> BigInt,
        sanity_level -> Integer,
        x_restrict -> Integer,
        #[sql_name = "type"]
        illust_type -> Text,
        image_urls_json -> Text,
        tags_json -> Text,
        downloaded -> Bool,
        download_path -> Nullable<Text>,
        downloaded_at -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
        file_size -> Nullable<BigInt>,
        bookmark_order -> Nullable<BigInt>,
        is_access_limited -> Bool,
    }
}

diesel::table! {
    download_history (id) {
        id -> Integer,
        illust_id -> BigInt,
        download_time -> Text,
        success -> Bool,
        file_size -> Nullable<BigInt>,
        error_message -> Nullable<Text>,
    }
}

diesel::joinable!(illusts -> users (user_id));
diesel::allow_tables_to_appear_in_same_query!(users, illusts, download_history);
