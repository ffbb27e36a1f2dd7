//! End-to-end scenarios driving two `Session`s over an in-memory
//! `PipeTransport` pair, in the shape of the teacher's `tests/feature_suite.rs`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meshline::{Extension, ProtocolError, Session, SessionOptions};
use meshline::transport::PipeTransport;

fn echo_pair() -> (Session, Session, Extension<Vec<u8>>, Extension<Vec<u8>>) {
    let (a, b) = PipeTransport::pair();
    let session_a = Session::new(a, SessionOptions::default());
    let session_b = Session::new(b, SessionOptions::default());
    (session_a, session_b, Extension::new("test.echo"), Extension::new("test.echo"))
}

#[tokio::test]
async fn s1_request_gets_a_matching_response() {
    let (session_a, session_b, ext_a, ext_b) = echo_pair();

    ext_b.set_on_message(|_session, data: Vec<u8>, _options| async move {
        let mut reply = b"echo:".to_vec();
        reply.extend(data);
        Ok(Some(reply))
    });

    session_a.add_extension(ext_a.clone()).unwrap();
    session_b.add_extension(ext_b).unwrap();

    let (ra, rb) = tokio::join!(session_a.init(None), session_b.init(None));
    ra.unwrap();
    rb.unwrap();

    let response = ext_a.request(b"ping".to_vec()).await.unwrap();
    assert_eq!(response, Some(b"echo:ping".to_vec()));
}

#[tokio::test]
async fn s2_oneway_send_gets_no_response_and_handler_still_runs() {
    let (session_a, session_b, ext_a, ext_b) = echo_pair();

    let received: Arc<tokio::sync::Mutex<Option<Vec<u8>>>> =
        Arc::new(tokio::sync::Mutex::new(None));
    let received_for_handler = received.clone();
    ext_b.set_on_message(move |_session, data: Vec<u8>, _options| {
        let received = received_for_handler.clone();
        async move {
            *received.lock().await = Some(data);
            Ok(None)
        }
    });

    session_a.add_extension(ext_a.clone()).unwrap();
    session_b.add_extension(ext_b).unwrap();

    let (ra, rb) = tokio::join!(session_a.init(None), session_b.init(None));
    ra.unwrap();
    rb.unwrap();

    let result = ext_a.notify(b"fire-and-forget".to_vec()).await;
    assert!(result.is_ok());

    for _ in 0..50 {
        if received.lock().await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(received.lock().await.as_deref(), Some(b"fire-and-forget".as_slice()));
}

#[tokio::test]
async fn s3_remote_handler_error_surfaces_as_err_system() {
    let (session_a, session_b, ext_a, ext_b) = echo_pair();

    ext_b.set_on_message(|_session, _data: Vec<u8>, _options| async move {
        Err(ProtocolError::System("handler exploded".into()))
    });

    session_a.add_extension(ext_a.clone()).unwrap();
    session_b.add_extension(ext_b).unwrap();

    let (ra, rb) = tokio::join!(session_a.init(None), session_b.init(None));
    ra.unwrap();
    rb.unwrap();

    let err = ext_a.request(b"ping".to_vec()).await.unwrap_err();
    assert_eq!(err.code(), "ERR_SYSTEM");
}

#[tokio::test]
async fn s4_unanswered_request_times_out() {
    let (session_a, session_b, _unused_a, ext_b) = echo_pair();
    let ext_a: Extension<Vec<u8>> = Extension::with_timeout("test.echo", 50);

    ext_b.set_on_message(|_session, _data: Vec<u8>, _options| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(None)
    });

    session_a.add_extension(ext_a.clone()).unwrap();
    session_b.add_extension(ext_b).unwrap();

    let (ra, rb) = tokio::join!(session_a.init(None), session_b.init(None));
    ra.unwrap();
    rb.unwrap();

    let err = ext_a.request(b"ping".to_vec()).await.unwrap_err();
    assert!(matches!(err, ProtocolError::RequestTimeout));
    assert_eq!(err.code(), "ERR_REQUEST_TIMEOUT");
}

#[tokio::test]
async fn s5_init_veto_prevents_handshake_on_both_sides() {
    let (session_a, session_b, ext_a, ext_b) = echo_pair();

    ext_a.set_on_init(|| async move { Err(ProtocolError::InitFailed("not ready".into())) });

    let handshook_a = Arc::new(AtomicBool::new(false));
    let handshook_b = Arc::new(AtomicBool::new(false));
    let flag_a = handshook_a.clone();
    let flag_b = handshook_b.clone();
    ext_a.set_on_handshake(move || {
        let flag_a = flag_a.clone();
        async move {
            flag_a.store(true, Ordering::SeqCst);
            Ok(())
        }
    });
    ext_b.set_on_handshake(move || {
        let flag_b = flag_b.clone();
        async move {
            flag_b.store(true, Ordering::SeqCst);
            Ok(())
        }
    });

    session_a.add_extension(ext_a).unwrap();
    session_b.add_extension(ext_b).unwrap();

    let (ra, rb) = tokio::join!(session_a.init(None), session_b.init(None));

    assert!(matches!(ra, Err(ProtocolError::InitFailed(_))));
    assert!(matches!(rb, Err(ProtocolError::ConnectionInvalid(_))));
    assert!(!handshook_a.load(Ordering::SeqCst));
    assert!(!handshook_b.load(Ordering::SeqCst));
}

#[tokio::test]
async fn close_rejects_further_sends_and_drains_pending_calls() {
    let (session_a, session_b, ext_a, ext_b) = echo_pair();

    ext_b.set_on_message(|_session, _data: Vec<u8>, _options| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(None)
    });

    session_a.add_extension(ext_a.clone()).unwrap();
    session_b.add_extension(ext_b).unwrap();

    let (ra, rb) = tokio::join!(session_a.init(None), session_b.init(None));
    ra.unwrap();
    rb.unwrap();

    // An in-flight call should be rejected immediately by `close()` rather
    // than left to run out its own (much longer) per-call timeout.
    let in_flight = tokio::spawn({
        let ext_a = ext_a.clone();
        async move { ext_a.request(b"ping".to_vec()).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    session_a.close().await.unwrap();

    let in_flight_result = tokio::time::timeout(Duration::from_millis(500), in_flight)
        .await
        .expect("close() should drain the pending call well within its 2s request timeout")
        .unwrap();
    assert!(in_flight_result.is_err());

    // Further sends on a closed extension reject synchronously, with no
    // round trip to the (already torn down) transport.
    let rejected = tokio::time::timeout(
        Duration::from_millis(5),
        ext_a.request(b"too-late".to_vec()),
    )
    .await
    .expect("a closed extension must reject send() without awaiting I/O");
    assert!(matches!(rejected, Err(ProtocolError::Closed)));
}

#[tokio::test]
async fn s6_mismatched_topics_invalidate_the_connection_before_handshake() {
    let (a, b) = PipeTransport::pair();
    let session_a = Session::new(a, SessionOptions::default());
    let session_b = Session::new(b, SessionOptions::default());

    let (ra, rb) = tokio::join!(
        session_a.init(Some([0xAAu8; 32])),
        session_b.init(Some([0xBBu8; 32]))
    );

    assert!(matches!(ra, Err(ProtocolError::ConnectionInvalid(_))));
    assert!(matches!(rb, Err(ProtocolError::ConnectionInvalid(_))));
}
