use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use evsim_engine::{FleetEngine, FleetSnapshot};
use std::sync::Arc;

use crate::command::fleet_error_to_response;

/// Latest snapshot published by the sampler
pub async fn get_fleet(State(fleet): State<Arc<FleetEngine>>) -> Json<FleetSnapshot> {
    tracing::debug!("Getting fleet snapshot");
    Json(fleet.latest())
}

/// Live state of one station, addressed by its 1-based index
pub async fn get_station(
    State(fleet): State<Arc<FleetEngine>>,
    Path(index): Path<usize>,
) -> impl IntoResponse {
    tracing::debug!("Getting station {}", index);
    match fleet.station(index) {
        Ok(station) => (StatusCode::OK, Json(station.snapshot())).into_response(),
        Err(error) => fleet_error_to_response(error).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, routing::get};
    use axum::{body::Body, http::Request};
    use evsim_core::{StationConfig, StationSnapshot, StationStatus};
    use tower::util::ServiceExt;

    fn create_app(fleet: Arc<FleetEngine>) -> Router {
        Router::new()
            .route("/fleet", get(get_fleet))
            .route("/stations/{index}", get(get_station))
            .with_state(fleet)
    }

    fn test_fleet() -> Arc<FleetEngine> {
        Arc::new(FleetEngine::with_seed(
            (1..=3)
                .map(|i| StationConfig::new(format!("charger-{}", i), 40))
                .collect(),
            11,
        ))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_fleet_endpoint_before_first_tick() {
        let (status, body) = get_json(create_app(test_fleet()), "/fleet").await;
        assert_eq!(status, StatusCode::OK);

        let snapshot: FleetSnapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(snapshot.tick, 0);
        assert_eq!(snapshot.stations.len(), 3);
        assert!(
            snapshot
                .stations
                .iter()
                .all(|s| s.status == StationStatus::Available)
        );
    }

    #[tokio::test]
    async fn test_fleet_endpoint_serves_latest_tick() {
        let fleet = test_fleet();
        fleet.set_setpoint(2, 10).unwrap();
        fleet.start(2).unwrap();
        fleet.tick();

        let (status, body) = get_json(create_app(Arc::clone(&fleet)), "/fleet").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["tick"], 1);
        let station = &json["stations"][1];
        assert_eq!(station["stationId"], "charger-2");
        assert_eq!(station["status"], "Charging");
        assert_eq!(station["statusCode"], 3);
        assert_eq!(station["activePowerWatts"], 2300);
        assert_eq!(station["setpointCurrentAmps"], 10);
    }

    #[tokio::test]
    async fn test_station_endpoint() {
        let fleet = test_fleet();
        fleet.set_current(3, 17).unwrap();

        let (status, body) = get_json(create_app(Arc::clone(&fleet)), "/stations/3").await;
        assert_eq!(status, StatusCode::OK);
        let station: StationSnapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(station.station_id, "charger-3");
        assert_eq!(station.current_amps, 17);

        let (status, _) = get_json(create_app(Arc::clone(&fleet)), "/stations/4").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(create_app(fleet), "/stations/0").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
