diesel::table! {
    device_flows (user_code) {
        user_code -> Text,
        device_code -> Text,
        client_id -> Text,
        scope -> Text,
        status -> Text,
        creation_time -> Timestamp,
        id_token -> Nullable<Text>,
    }
}

diesel::table! {
    authorization_flows (uuid) {
        uuid -> Text,
        client_id -> Text,
        scope -> Text,
        code_challenge -> Text,
        code_challenge_method -> Text,
        redirect_uri -> Text,
        status -> Text,
        code -> Nullable<Text>,
        creation_time -> Timestamp,
        id_token -> Nullable<Text>,
    }
}

diesel::table! {
    refresh_tokens (jti) {
        jti -> Text,
        status -> Text,
        creation_time -> Timestamp,
        scope -> Text,
        sub -> Text,
        preferred_username -> Text,
        legacy_exchange -> Bool,
    }
}

diesel::table! {
    pilots (pilot_job_reference) {
        pilot_job_reference -> Text,
        pilot_stamp -> Text,
        vo -> Text,
        grid_type -> Text,
        status -> Text,
        submission_time -> Timestamp,
        last_update_time -> Timestamp,
        hashed_secret -> Nullable<Text>,
        secret_creation_time -> Nullable<Timestamp>,
    }
}

diesel::table! {
    jobs (job_id) {
        job_id -> BigInt,
        vo -> Text,
        owner -> Text,
        owner_group -> Text,
        job_name -> Text,
        job_type -> Text,
        status -> Text,
        minor_status -> Text,
        application_status -> Text,
        site -> Text,
        submission_time -> Timestamp,
        last_update_time -> Timestamp,
    }
}

diesel::table! {
    sandboxes (pfn) {
        pfn -> Text,
        vo -> Text,
        owner_id -> Text,
        size -> BigInt,
        checksum_algorithm -> Text,
        checksum -> Text,
        assigned -> Bool,
        last_access_time -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    device_flows,
    authorization_flows,
    refresh_tokens,
    pilots,
    jobs,
    sandboxes,
);
