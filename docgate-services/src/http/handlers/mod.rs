pub mod convert;
pub mod ping;
pub mod route;
pub mod webhook;

pub use convert::{ConversionJob, ConvertHandler, ConvertTimeouts, Converter};
pub use ping::PingHandler;
pub use route::{RouteConfig, RouteHandler, RouteHandlerFactory};
pub use webhook::WebhookDelivery;
