use crate::{Handel, Value};
use log::{info, warn};

/// Board-level values read once per module.
const BOARD_PARAMS: &[&str] = &["get_firmware_version", "get_connected"];

/// Read back every acquisition value of every detChan and log them at INFO,
/// one block per detChan. Values the backend refuses are skipped.
pub fn log_all(handel: &mut Handel) {
    let mut logged_modules = Vec::new();

    for det_chan in handel.channels().singles() {
        let Ok(module_alias) = handel.module_from_detchan(det_chan) else {
            continue;
        };
        let mod_chan = handel.get_module_channel(det_chan);
        let mut param_log = String::new();

        if !logged_modules.contains(&module_alias) {
            for &op in BOARD_PARAMS {
                let mut value = Value::None;
                if handel.board_operation(det_chan, op, &mut value).is_ok() {
                    param_log.push_str(&format!("{}: {}\n", op.trim_start_matches("get_"), value));
                }
            }
            logged_modules.push(module_alias.clone());
        }

        let names: Vec<String> = handel
            .module(&module_alias)
            .and_then(|m| m.defaults.get(mod_chan).cloned().flatten())
            .and_then(|alias| handel.defaults_set(&alias))
            .map(|d| d.entries().iter().map(|e| e.name.clone()).collect())
            .unwrap_or_default();
        if names.is_empty() {
            warn!("detChan {det_chan}: no acquisition values to log");
            continue;
        }

        for name in &names {
            match handel.get_acquisition_values(det_chan, name) {
                Ok(value) => param_log.push_str(&format!("{name}: {value}\n")),
                Err(_) => continue,
            }
        }

        if param_log.ends_with('\n') {
            param_log.pop();
        }
        info!(
            "detChan {} ({} channel {}) parameters:\n{}",
            det_chan, module_alias, mod_chan, param_log
        );
    }
}
