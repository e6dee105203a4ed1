//! Structural checks run by `start_system` before any backend is touched.

use crate::Handel;
use crate::Result;
use log::debug;

/// Check the whole configuration. The first problem found is returned.
pub(crate) fn validate_configuration(handel: &mut Handel) -> Result<()> {
    for firmware in handel.firmware.iter_mut() {
        firmware
            .validate()
            .map_err(|e| e.context(format!("firmware '{}'", firmware.alias)))?;
    }
    for detector in handel.detectors.iter() {
        detector
            .validate()
            .map_err(|e| e.context(format!("detector '{}'", detector.alias)))?;
    }
    validate_modules(handel)?;
    handel.channels.validate_sets()?;
    if handel.channels.singles().is_empty() {
        bail!(NoDetChans, "no detChans are defined");
    }
    debug!("configuration is valid");
    Ok(())
}

fn validate_modules(handel: &Handel) -> Result<()> {
    for module in handel.modules.iter() {
        let alias = &module.alias;
        module.validate()?;
        handel.backend_for(module)?;

        for chan in 0..module.number_of_channels {
            let det_chan = module.channels[chan];
            if det_chan < 0 {
                continue;
            }
            if handel.channels.find_alias(det_chan)? != alias.as_str() {
                bail!(
                    InvalidDetChan,
                    "module '{alias}' channel {chan}: detChan {det_chan} belongs to another module"
                );
            }
            let Some(det_alias) = &module.detector[chan] else {
                bail!(NoAlias, "module '{alias}' channel {chan} has no detector");
            };
            let detector = handel.detectors.get(det_alias)?;
            let k = module.detector_chan[chan].unwrap_or(0);
            if k >= detector.nchan {
                bail!(
                    BadChannel,
                    "module '{alias}' channel {chan}: detector '{det_alias}' has {} channels, not {k}",
                    detector.nchan
                );
            }
            if let Some(fw) = &module.firmware[chan] {
                handel.firmware.get(fw)?;
            }
            if let Some(defaults) = &module.defaults[chan] {
                handel.defaults.get(defaults)?;
            }
        }
    }
    Ok(())
}
