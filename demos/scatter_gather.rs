use std::time::Duration;

use fanout::{policy::Broadcast, Communicator};

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let mut args = std::env::args().skip(1);
    let port = args
        .next()
        .map(|port| port.parse().expect("invalid port"))
        .unwrap_or(9000);
    let request: i32 = args
        .next()
        .map(|request| request.parse().expect("invalid request"))
        .unwrap_or(21);

    let mut communicator = Communicator::new(Broadcast).unwrap();
    let mut replies = Vec::new();
    let collected = communicator
        .outbound(port)
        .unwrap()
        .distribute(&request)
        .unwrap()
        .collect(Duration::from_millis(100), |reply: i32| replies.push(reply));

    tracing::info!(collected, ?replies, "collection finished");
}
