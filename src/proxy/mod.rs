pub mod handlers;
pub mod mappers;
pub mod middleware;
pub mod model_map;
pub mod providers;
pub mod routes;
pub mod server;
pub mod state;
pub mod token;
pub mod upstream;

pub use server::ProxyServer;
pub use state::AppState;
pub use token::TokenManager;
