use std::time::{Duration, Instant};

use mtsender_mtproto::{RESEND_THRESHOLD, RequestState};

#[test]
fn fresh_request_needs_nothing() {
    let r = RequestState::new(1, true);
    assert!(!r.sent());
    assert!(r.send_time().is_none());
    assert!(!r.need_resend());
}

#[test]
fn dirty_request_needs_resend_immediately() {
    let mut r = RequestState::new(1, true);
    r.on_send_success();
    r.mark_dirty();
    assert!(r.need_resend());
}

#[test]
fn confirmed_request_waits_for_threshold() {
    let t0 = Instant::now();
    let mut r = RequestState::new(1, true);
    r.on_send_success_at(t0);
    assert!(!r.need_resend_at(t0 + Duration::from_millis(2999), RESEND_THRESHOLD));
    assert!(r.need_resend_at(t0 + Duration::from_millis(3001), RESEND_THRESHOLD));
}

#[test]
fn ack_stops_the_resend_clock() {
    let t0 = Instant::now();
    let mut r = RequestState::new(1, true);
    r.on_send_success_at(t0);
    r.on_confirm();
    assert!(r.confirm_received());
    assert!(!r.need_resend_at(t0 + Duration::from_secs(60), RESEND_THRESHOLD));
}

#[test]
fn unconfirmed_request_is_never_resent_by_timer() {
    let t0 = Instant::now();
    let mut r = RequestState::new(2, false);
    r.on_send_success_at(t0);
    assert!(!r.need_resend_at(t0 + Duration::from_secs(60), RESEND_THRESHOLD));
}

#[test]
fn resend_restarts_the_lifecycle() {
    let t0 = Instant::now();
    let mut r = RequestState::new(1, true);
    r.on_send_success_at(t0);
    r.mark_dirty();
    r.on_resent(7);
    assert_eq!(r.sequence(), 7);
    assert!(!r.dirty());
    assert!(!r.sent());
    assert!(!r.confirm_received());
    assert!(!r.need_resend());

    let t1 = t0 + Duration::from_secs(10);
    r.on_send_success_at(t1);
    assert!(!r.need_resend_at(t1 + Duration::from_millis(10), RESEND_THRESHOLD));
}

#[test]
fn custom_threshold_is_honoured() {
    let t0 = Instant::now();
    let mut r = RequestState::new(1, true);
    r.on_send_success_at(t0);
    let short = Duration::from_millis(100);
    assert!(r.need_resend_at(t0 + Duration::from_millis(150), short));
}

#[test]
fn response_is_recorded() {
    let mut r = RequestState::new(1, true);
    r.on_send_success();
    r.on_response();
    assert!(r.responded());
}
