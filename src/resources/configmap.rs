//! ConfigMap generation.
//!
//! The ConfigMap is the only channel from the instance declaration into the
//! pods: the engine reads `config.ini` from it and the downloader reads the
//! source URLs from `schedules` and `osm`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, ConfigMapVolumeSource, KeyToPath, Volume};

use crate::controller::validation::InstanceSpec;
use crate::resources::common::{Component, config_map_name, owned_metadata};

/// Key holding the engine configuration text.
pub const CONFIG_FILE_KEY: &str = "config-file";
/// Key holding the timetable URL.
pub const SCHEDULES_KEY: &str = "schedules";
/// Key holding the OpenStreetMap URL.
pub const OSM_KEY: &str = "osm";

/// Name of the volume the ConfigMap is mounted from.
pub const CONFIG_VOLUME: &str = "config";
/// Mount path of the ConfigMap volume.
pub const CONFIG_MOUNT_PATH: &str = "/config";

/// Generate the ConfigMap for an instance.
pub fn generate_config_map(spec: &InstanceSpec) -> ConfigMap {
    ConfigMap {
        metadata: owned_metadata(spec, config_map_name(&spec.name), Component::Config),
        data: Some(BTreeMap::from([
            (CONFIG_FILE_KEY.to_string(), spec.config_text.clone()),
            (SCHEDULES_KEY.to_string(), spec.schedule_url.clone()),
            (OSM_KEY.to_string(), spec.osm_url.clone()),
        ])),
        ..Default::default()
    }
}

/// Volume projecting the ConfigMap keys onto the file names the containers expect.
pub fn config_volume(spec: &InstanceSpec) -> Volume {
    let item = |key: &str, path: &str| KeyToPath {
        key: key.to_string(),
        path: path.to_string(),
        mode: None,
    };
    Volume {
        name: CONFIG_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map_name(&spec.name),
            items: Some(vec![
                item(CONFIG_FILE_KEY, "config.ini"),
                item(SCHEDULES_KEY, "schedules"),
                item(OSM_KEY, "osm"),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
