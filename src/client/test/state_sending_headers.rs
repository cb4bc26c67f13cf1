use crate::client::test::TestSliceExt;
use crate::client::State;
use crate::{Error, Status};

use super::scenario::Scenario;

const PRELUDE: &str = "POST /v1/chat/completions HTTP/1.1\r\n\
    host: chat.test\r\n\
    authorization: Bearer sk-test\r\n\
    content-type: application/json\r\n\
    content-length: 27\r\n\
    connection: close\r\n\
    \r\n";

#[test]
fn prelude_written() {
    let mut s = Scenario::builder().build();
    s.to_streaming_body();

    assert_eq!(s.written_prelude().as_str(), PRELUDE);
    assert_eq!(s.wire.borrow().written.len(), PRELUDE.len());
}

#[test]
fn partial_writes_resumed() {
    let mut s = Scenario::builder().write_limit(7).build();
    s.trigger();
    s.poll_until(State::SendingHeaders);
    s.wire.borrow_mut().write_blocks = 2;

    s.poll();
    s.poll();
    assert!(s.wire.borrow().written.is_empty());

    s.poll();
    assert_eq!(s.state(), State::SendingHeaders);
    assert_eq!(s.wire.borrow().written.len(), 7);

    s.poll_until(State::StreamingBody);
    assert_eq!(s.written_prelude().as_str(), PRELUDE);
}

#[test]
fn prelude_overflow() {
    let mut s = Scenario::builder().api_key("k".repeat(600)).build();
    s.trigger();

    s.poll_until(State::Error);
    assert!(matches!(
        s.engine.last_error(),
        Some(Error::PreludeOverflow(512))
    ));
    assert!(s.wire.borrow().written.is_empty());

    let (_, status) = s.read_response();
    assert_eq!(status, Status::Failed);
}

#[test]
fn write_failure() {
    let mut s = Scenario::builder().build();
    s.trigger();
    s.poll_until(State::SendingHeaders);
    s.wire.borrow_mut().write_fail = true;

    s.poll();
    assert_eq!(s.state(), State::Error);
    assert!(matches!(s.engine.last_error(), Some(Error::Write(_))));

    let (_, status) = s.read_response();
    assert_eq!(status, Status::Failed);
}
