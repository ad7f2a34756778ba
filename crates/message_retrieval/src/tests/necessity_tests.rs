use super::*;

use std::time::Duration;

fn background_since(at: Instant) -> AppState {
    AppState {
        is_foreground: false,
        last_interaction_time: at,
    }
}

fn inputs(app: AppState, now: Instant) -> NecessityInputs {
    NecessityInputs {
        registered: true,
        push_available: true,
        has_network: true,
        censored: false,
        app,
        now,
    }
}

#[test]
fn foreground_online_registered_needs_connection() {
    let now = Instant::now();
    let app = AppState {
        is_foreground: true,
        last_interaction_time: now,
    };
    assert!(is_connection_needed(
        &inputs(app, now + Duration::from_secs(3600)),
        &RetrievalConfig::default()
    ));
}

#[test]
fn matches_closed_form_for_every_flag_combination() {
    let config = RetrievalConfig::default();
    let start = Instant::now();
    let recently = start + Duration::from_secs(5);
    let long_ago = start + Duration::from_secs(600);

    for mask in 0u8..32 {
        let registered = mask & 1 != 0;
        let push_available = mask & 2 != 0;
        let has_network = mask & 4 != 0;
        let foreground = mask & 8 != 0;
        let recent = mask & 16 != 0;

        let case = NecessityInputs {
            registered,
            push_available,
            has_network,
            censored: false,
            app: AppState {
                is_foreground: foreground,
                last_interaction_time: start,
            },
            now: if recent { recently } else { long_ago },
        };
        let expected = registered && has_network && (foreground || recent || !push_available);
        assert_eq!(
            is_connection_needed(&case, &config),
            expected,
            "registered={registered} push={push_available} network={has_network} fg={foreground} recent={recent}"
        );
    }
}

#[test]
fn background_window_closes_after_two_minutes() {
    let config = RetrievalConfig::default();
    let start = Instant::now();
    let app = background_since(start);

    assert!(is_connection_needed(
        &inputs(app, start + Duration::from_secs(119)),
        &config
    ));
    assert!(!is_connection_needed(
        &inputs(app, start + Duration::from_secs(120)),
        &config
    ));
}

#[test]
fn censored_endpoint_shrinks_background_window() {
    let config = RetrievalConfig::default();
    let start = Instant::now();
    let now = start + Duration::from_secs(30);

    let normal = inputs(background_since(start), now);
    assert!(is_connection_needed(&normal, &config));

    let censored = NecessityInputs {
        censored: true,
        ..normal
    };
    assert!(!is_connection_needed(&censored, &config));
}

#[test]
fn missing_push_keeps_connection_in_background() {
    let start = Instant::now();
    let case = NecessityInputs {
        push_available: false,
        ..inputs(background_since(start), start + Duration::from_secs(86_400))
    };
    assert!(is_connection_needed(&case, &RetrievalConfig::default()));
}

#[test]
fn collect_reads_account_flags() {
    let flags = AccountFlags::new(true, false);
    flags.set_censored(true);
    let now = Instant::now();
    let collected = NecessityInputs::collect(&flags, background_since(now), false, now);

    assert!(collected.registered);
    assert!(!collected.push_available);
    assert!(collected.censored);
    assert!(!collected.has_network);
    assert!(flags.can_process_messages());
}
