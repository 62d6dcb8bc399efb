use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());
    raw.tracker.hasher = Some("fnv1a".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        tracker_hasher: Some("sha256".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.tracker.hasher, HasherKind::Sha256);
}

#[test]
fn tracker_defaults() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let tracker = settings.tracker;

    assert_eq!(tracker.hasher, HasherKind::Fnv1a);
    assert!(tracker.emit_headers_without_condition);
    assert_eq!(
        tracker.fetch_timeout,
        Some(Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS))
    );
    assert_eq!(tracker.pool_capacity, DEFAULT_POOL_CAPACITY);
    assert_eq!(
        tracker.invalid_response_directives,
        vec!["immutable".to_string(), "no-store".to_string()]
    );
    assert!(tracker.invalid_request_directives.is_empty());
    assert_eq!(tracker.build_epoch, BuildEpoch::current());
}

#[test]
fn zero_fetch_timeout_disables_deadline() {
    let mut raw = RawSettings::default();
    raw.tracker.fetch_timeout_ms = Some(0);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.tracker.fetch_timeout.is_none());
}

#[test]
fn invalid_hasher_is_rejected() {
    let mut raw = RawSettings::default();
    raw.tracker.hasher = Some("crc32".to_string());
    let err = Settings::from_raw(raw).expect_err("invalid hasher");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "tracker.hasher",
            ..
        }
    ));
}

#[test]
fn build_epoch_must_be_digits() {
    let mut raw = RawSettings::default();
    raw.tracker.build_epoch = Some("v1.2".to_string());
    let err = Settings::from_raw(raw).expect_err("invalid epoch");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "tracker.build_epoch",
            ..
        }
    ));

    let mut raw = RawSettings::default();
    raw.tracker.build_epoch = Some("638123456789000000".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.tracker.build_epoch.as_str(), "638123456789000000");
}

#[test]
fn directives_are_normalized() {
    let mut raw = RawSettings::default();
    raw.tracker.invalid_request_directives = Some(vec![" No-Store ".to_string(), String::new()]);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.tracker.invalid_request_directives,
        vec!["no-store".to_string()]
    );
}

#[test]
fn blank_entity_table_is_rejected() {
    let mut raw = RawSettings::default();
    raw.tracker
        .entities
        .insert("Post".to_string(), "  ".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn zero_pool_capacity_is_rejected() {
    let mut raw = RawSettings::default();
    raw.tracker.pool_capacity = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["tracker"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_tracking_arguments() {
    let args = CliArgs::parse_from([
        "tracker",
        "tracking",
        "enable",
        "--database-url",
        "postgres://example",
        "public.posts",
    ]);

    match args.command.expect("tracking command") {
        Command::Tracking(tracking) => {
            assert!(matches!(tracking.command, TrackingCommand::Enable(_)));
            let table = tracking.command.table_args();
            assert_eq!(table.table, "public.posts");
            assert_eq!(
                table.database.database_url.as_deref(),
                Some("postgres://example")
            );
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_migrate_arguments() {
    let args = CliArgs::parse_from(["tracker", "migrate", "--database-url", "postgres://m"]);

    match args.command.expect("migrate command") {
        Command::Migrate(migrate) => {
            assert_eq!(migrate.database.database_url.as_deref(), Some("postgres://m"));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "tracker",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--tracker-emit-headers",
        "false",
        "--tracker-source",
        "memory",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(serve.overrides.tracker_emit_headers, Some(false));
            assert_eq!(serve.overrides.tracker_source.as_deref(), Some("memory"));
        }
        _ => panic!("wrong command parsed"),
    }
}

fn with_env<T>(vars: &[(&str, &str)], body: impl FnOnce() -> T) -> T {
    for (key, value) in vars {
        // SAFETY: env tests are serialized and no other thread reads these keys.
        unsafe { std::env::set_var(key, value) };
    }
    let result = body();
    for (key, _) in vars {
        // SAFETY: as above.
        unsafe { std::env::remove_var(key) };
    }
    result
}

#[test]
#[serial_test::serial]
fn environment_layer_populates_tracker_settings() {
    let settings = with_env(
        &[
            ("TRACKER__TRACKER__HASHER", "murmur3"),
            ("TRACKER__TRACKER__INVALID_REQUEST_DIRECTIVES", "No-Cache,no-store"),
        ],
        || load(&CliArgs::parse_from(["tracker"])),
    )
    .expect("valid settings");

    assert_eq!(settings.tracker.hasher, HasherKind::Murmur3);
    assert_eq!(
        settings.tracker.invalid_request_directives,
        vec!["no-cache".to_string(), "no-store".to_string()]
    );
}

#[test]
#[serial_test::serial]
fn cli_overrides_beat_environment() {
    let settings = with_env(&[("TRACKER__TRACKER__HASHER", "murmur3")], || {
        load(&CliArgs::parse_from([
            "tracker",
            "serve",
            "--tracker-hasher",
            "sha256",
        ]))
    })
    .expect("valid settings");

    assert_eq!(settings.tracker.hasher, HasherKind::Sha256);
}
