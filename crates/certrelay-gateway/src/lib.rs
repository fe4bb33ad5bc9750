//! HTTP surface of the certificate relay: health, status, and certificate delivery.

pub mod relay_gateway;

pub use relay_gateway::{
    bind_relay_gateway_listener, build_relay_gateway_router, run_relay_gateway_server,
    serve_relay_gateway, RelayGatewayServerConfig, RelayGatewayState, HEALTH_CONNECTING_TEXT,
    HEALTH_ENDPOINT, HEALTH_READY_TEXT, SEND_CERTIFICATE_ENDPOINT, STATUS_ENDPOINT,
};
