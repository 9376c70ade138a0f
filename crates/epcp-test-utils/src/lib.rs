// epcp-test-utils: Shared test doubles for the EPCP client's integration
// tests.
//
// Provides a mock HTTP endpoint that speaks the publish/subscription wire
// protocol (`MockEpcpServer`) and a mock message-bus discovery responder
// (`MockDiscoveryResponder`), mirroring how `rt-test-utils` provides
// `MockWsServer`/`MockWsClient` for the forwarding suite.

pub mod mock_discovery_responder;
pub mod mock_epcp_server;

pub use mock_discovery_responder::MockDiscoveryResponder;
pub use mock_epcp_server::MockEpcpServer;
