use std::fs;
use std::path::Path;

use reqwest::Url;
use serde::Serialize;

use crate::errors::{AppError, AppResult};
use crate::places::{LatLng, PlaceRecord};

pub const DEFAULT_ZOOM: u8 = 15;
const FALLBACK_CENTER: LatLng = LatLng { lat: 0.0, lng: 0.0 };
const SHARE_LINK_BASE: &str = "https://www.google.com/maps";
const TILE_URL: &str = "https://{s}.basemaps.cartocdn.com/light_all/{z}/{x}/{y}{r}.png";
const TILE_ATTRIBUTION: &str = "&copy; OpenStreetMap contributors &copy; CARTO";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapMarker {
    pub lat: f64,
    pub lng: f64,
    pub label: String,
}

/// One-shot map snapshot of a record set. Build a new one after the record
/// set changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapView {
    pub center: LatLng,
    pub zoom: u8,
    pub markers: Vec<MapMarker>,
}

impl MapView {
    pub fn from_records(records: &[PlaceRecord]) -> Self {
        let markers: Vec<MapMarker> = records
            .iter()
            .filter_map(|record| {
                record.location.map(|loc| MapMarker {
                    lat: loc.lat,
                    lng: loc.lng,
                    label: record.display_name().to_string(),
                })
            })
            .collect();
        let center = markers
            .first()
            .map(|marker| LatLng {
                lat: marker.lat,
                lng: marker.lng,
            })
            .unwrap_or(FALLBACK_CENTER);

        Self {
            center,
            zoom: DEFAULT_ZOOM,
            markers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Standalone Leaflet page with one popup marker per place.
    pub fn render_html(&self) -> AppResult<String> {
        // Marker labels come from the provider; keep them from closing the
        // script element.
        let markers = serde_json::to_string(&self.markers)?.replace("</", "<\\/");
        Ok(format!(
            r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Places</title>
<link rel="stylesheet" href="https://unpkg.com/leaflet@1.9.4/dist/leaflet.css">
<script src="https://unpkg.com/leaflet@1.9.4/dist/leaflet.js"></script>
<style>html, body, #map {{ height: 100%; margin: 0; }}</style>
</head>
<body>
<div id="map"></div>
<script>
const map = L.map("map").setView([{lat}, {lng}], {zoom});
L.tileLayer("{tiles}", {{ attribution: "{attribution}", subdomains: "abcd", maxZoom: 20 }}).addTo(map);
const markers = {markers};
for (const m of markers) {{
  L.marker([m.lat, m.lng]).bindPopup(document.createTextNode(m.label)).addTo(map);
}}
</script>
</body>
</html>
"#,
            lat = self.center.lat,
            lng = self.center.lng,
            zoom = self.zoom,
            tiles = TILE_URL,
            attribution = TILE_ATTRIBUTION,
            markers = markers,
        ))
    }

    pub fn write_html(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.render_html()?)?;
        Ok(())
    }

    /// Best-effort Google Maps link with one `q` parameter per marker. The
    /// provider may not show every marker.
    pub fn share_link(&self) -> AppResult<String> {
        let mut url = Url::parse(SHARE_LINK_BASE)
            .map_err(|err| AppError::Config(format!("invalid share link base: {err}")))?;
        {
            let mut query = url.query_pairs_mut();
            for marker in &self.markers {
                query.append_pair("q", &format!("{},{} ({})", marker.lat, marker.lng, marker.label));
            }
        }
        Ok(url.to_string())
    }
}
