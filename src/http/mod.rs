//! The one piece of external ingress the core owns: a heartbeat endpoint a
//! child can POST to. Everything else (CLI, dashboards) is an external
//! collaborator this crate only exposes method calls for.

use crate::context::SupervisorContext;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State, http::Status, post, routes};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct HeartbeatBody {
    pub process_id: String,
}

#[post("/api/heartbeat", data = "<body>")]
fn heartbeat(body: Json<HeartbeatBody>, context: &State<Arc<SupervisorContext>>) -> Status {
    match context.heartbeat.register_heartbeat(&body.process_id) {
        Ok(()) => Status::Ok,
        Err(_) => Status::NotFound,
    }
}

pub fn build(context: Arc<SupervisorContext>, address: &str, port: u16) -> Rocket<Build> {
    let figment = rocket::Config::figment()
        .merge(("address", address))
        .merge(("port", port));

    rocket::custom(figment).manage(context).mount("/", routes![heartbeat])
}
