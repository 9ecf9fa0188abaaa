use crate::state::AppState;
use axum::{Json, extract::State};
use serde::Serialize;
use voxroom_protocol::IceServer;

#[derive(Debug, Serialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServer>,
}

pub async fn get_ice_servers(State(state): State<AppState>) -> Json<IceServersResponse> {
    Json(ice_servers(&state.config))
}

pub fn ice_servers(config: &crate::state::Config) -> IceServersResponse {
    let mut ice_servers = vec![];

    // Add STUN servers
    for stun_url in &config.stun_servers {
        ice_servers.push(IceServer {
            urls: vec![stun_url.clone()],
            username: None,
            credential: None,
        });
    }

    // Add TURN servers
    for turn in &config.turn_servers {
        ice_servers.push(IceServer {
            urls: vec![turn.url.clone()],
            username: Some(turn.username.clone()),
            credential: Some(turn.credential.clone()),
        });
    }

    IceServersResponse { ice_servers }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Config, TurnServer};

    #[test]
    fn turn_servers_carry_credentials() {
        let config = Config {
            stun_servers: vec!["stun:stun.example.org:3478".to_string()],
            turn_servers: vec![TurnServer {
                url: "turn:turn.example.org:3478".to_string(),
                username: "alice".to_string(),
                credential: "secret".to_string(),
            }],
            ..Config::default()
        };

        let response = ice_servers(&config);
        assert_eq!(response.ice_servers.len(), 2);
        assert_eq!(response.ice_servers[0].username, None);
        assert_eq!(
            response.ice_servers[1].credential.as_deref(),
            Some("secret")
        );
    }
}
