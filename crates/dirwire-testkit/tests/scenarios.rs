//! Scenario suite over in-process pipes.

use dirwire_testkit::init_test_tracing;

#[tokio::test]
async fn single_reply() {
    init_test_tracing();
    dirwire_testkit::run_single_reply().await;
}

#[tokio::test]
async fn out_of_order_replies() {
    init_test_tracing();
    dirwire_testkit::run_out_of_order_replies().await;
}

#[tokio::test]
async fn read_timeout_then_abandon() {
    init_test_tracing();
    dirwire_testkit::run_read_timeout_then_abandon().await;
}

#[tokio::test]
async fn server_hangup_closes_requests() {
    init_test_tracing();
    dirwire_testkit::run_server_hangup_closes_requests().await;
}

#[tokio::test]
async fn cancel_sends_no_abandon() {
    init_test_tracing();
    dirwire_testkit::run_cancel_sends_no_abandon().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_routing() {
    init_test_tracing();
    dirwire_testkit::run_concurrent_routing(64).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn message_ids_increase() {
    init_test_tracing();
    dirwire_testkit::run_message_ids_increase().await;
}

#[tokio::test]
async fn close_with_outstanding() {
    init_test_tracing();
    dirwire_testkit::run_close_with_outstanding(8).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_double_cleanup() {
    init_test_tracing();
    for _ in 0..20 {
        dirwire_testkit::run_concurrent_double_cleanup().await;
    }
}

#[tokio::test]
async fn pause_and_upgrade() {
    init_test_tracing();
    dirwire_testkit::run_pause_and_upgrade().await;
}

#[tokio::test]
async fn replace_streams() {
    init_test_tracing();
    dirwire_testkit::run_replace_streams().await;
}

#[tokio::test]
async fn replace_streams_mid_read() {
    init_test_tracing();
    dirwire_testkit::run_replace_streams_mid_read().await;
}

#[tokio::test]
async fn failed_upgrade_tears_down() {
    init_test_tracing();
    dirwire_testkit::run_failed_upgrade_tears_down().await;
}

#[tokio::test]
async fn unsolicited_notification() {
    init_test_tracing();
    dirwire_testkit::run_unsolicited_notification().await;
}

#[tokio::test]
async fn malformed_frame_skipped() {
    init_test_tracing();
    dirwire_testkit::run_malformed_frame_skipped().await;
}

#[tokio::test]
async fn oversized_frame_fails_connection() {
    init_test_tracing();
    dirwire_testkit::run_oversized_frame_fails_connection().await;
}

#[tokio::test]
async fn bounded_reply_queue() {
    init_test_tracing();
    dirwire_testkit::run_bounded_reply_queue().await;
}

#[tokio::test]
async fn enumeration_guard_release() {
    init_test_tracing();
    dirwire_testkit::run_enumeration_guard_release().await;
}

#[tokio::test]
async fn open_through_factory() {
    init_test_tracing();
    dirwire_testkit::run_open_through_factory().await;
}

#[tokio::test]
async fn wire_trace() {
    init_test_tracing();
    dirwire_testkit::run_wire_trace().await;
}
