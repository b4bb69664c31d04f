mod common;

mod http_api;
mod setup;
