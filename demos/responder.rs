use fanout::{policy::Broadcast, Communicator};

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let port = std::env::args()
        .nth(1)
        .map(|port| port.parse().expect("invalid port"))
        .unwrap_or(9000);

    let mut communicator = Communicator::new(Broadcast).unwrap();
    communicator
        .inbound(port)
        .unwrap()
        .process(|source, request: i32| {
            tracing::info!(%source, request, "answering request");
            request * 2
        });
    tracing::info!(port, "serving");

    let events = communicator.events();
    std::thread::spawn(move || {
        for event in events {
            tracing::warn!(?event, "transport event");
        }
    });

    communicator.dispatch();
}
