use serde_json::json;

use crate::cdp::{CdpError, CdpSession};

/// The document-start script, with `__SEED__` replaced per connection.
///
/// Installed once per page target; the `__cp_stealth` guard makes a second
/// evaluation a no-op, so applying it twice is observationally equivalent
/// to applying it once.
const STEALTH_TEMPLATE: &str = r#"(() => {
  if (window.__cp_stealth) return;
  Object.defineProperty(window, '__cp_stealth', { value: true, configurable: false });
  const SEED = __SEED__;
  const rand = (n) => {
    let x = (SEED ^ n) >>> 0;
    x = Math.imul(x ^ (x >>> 16), 0x45d9f3b) >>> 0;
    x = Math.imul(x ^ (x >>> 16), 0x45d9f3b) >>> 0;
    return ((x ^ (x >>> 16)) >>> 0) / 0xffffffff;
  };

  Object.defineProperty(navigator, 'webdriver', { get: () => undefined });

  const fakePlugins = [
    { name: 'PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
    { name: 'Chrome PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
    { name: 'Chromium PDF Viewer', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
  ];
  Object.defineProperty(navigator, 'plugins', {
    get: () => {
      const arr = fakePlugins.map(p => Object.assign(Object.create(Plugin.prototype), p));
      arr.item = i => arr[i] || null;
      arr.namedItem = n => arr.find(p => p.name === n) || null;
      arr.refresh = () => {};
      return arr;
    },
  });
  Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
  Object.defineProperty(navigator, 'hardwareConcurrency', { get: () => 8 });
  Object.defineProperty(navigator, 'deviceMemory', { get: () => 8 });

  const originalQuery = Notification.permission;
  const nativePermissionsQuery = window.navigator.permissions.query.bind(window.navigator.permissions);
  window.navigator.permissions.query = (parameters) =>
    parameters && parameters.name === 'notifications'
      ? Promise.resolve({ state: originalQuery, onchange: null })
      : nativePermissionsQuery(parameters);

  const origGetImageData = CanvasRenderingContext2D.prototype.getImageData;
  CanvasRenderingContext2D.prototype.getImageData = function (...args) {
    const data = origGetImageData.apply(this, args);
    for (let i = 0; i < data.data.length; i += 4) {
      const jitter = rand(i) < 0.5 ? 0 : 1;
      data.data[i] = Math.min(255, data.data[i] ^ jitter);
    }
    return data;
  };

  const origGetParameter = WebGLRenderingContext.prototype.getParameter;
  WebGLRenderingContext.prototype.getParameter = function (parameter) {
    if (parameter === 37445) return 'Intel Inc.';
    if (parameter === 37446) return 'Intel Iris OpenGL Engine';
    return origGetParameter.call(this, parameter);
  };

  const origGetChannelData = AudioBuffer.prototype.getChannelData;
  AudioBuffer.prototype.getChannelData = function (...args) {
    const data = origGetChannelData.apply(this, args);
    for (let i = 0; i < data.length; i += 128) {
      data[i] = data[i] + (rand(i) - 0.5) * 1e-7;
    }
    return data;
  };
})();"#;

/// Render the stealth script for a connection's seed.
#[must_use]
pub fn stealth_script(seed: u32) -> String {
    STEALTH_TEMPLATE.replace("__SEED__", &seed.to_string())
}

/// Install the stealth script on a page target: register it for every new
/// document and evaluate it once on the current one.
///
/// # Errors
///
/// Returns `CdpError` if the registration command fails. The evaluation on
/// the already-loaded document is best-effort.
pub async fn install_stealth(session: &CdpSession, seed: u32) -> Result<(), CdpError> {
    let script = stealth_script(seed);

    session
        .send_command(
            "Page.addScriptToEvaluateOnNewDocument",
            Some(json!({ "source": script, "runImmediately": true })),
        )
        .await?;

    // The current document already ran its scripts; patch it in place.
    let _ = session
        .send_command(
            "Runtime.evaluate",
            Some(json!({ "expression": script, "returnByValue": false })),
        )
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_is_substituted() {
        let script = stealth_script(12345);
        assert!(script.contains("const SEED = 12345;"));
        assert!(!script.contains("__SEED__"));
    }

    #[test]
    fn distinct_seeds_produce_distinct_scripts() {
        assert_ne!(stealth_script(1), stealth_script(2));
    }

    #[test]
    fn script_is_guarded_for_idempotence() {
        let script = stealth_script(7);
        assert!(script.contains("if (window.__cp_stealth) return;"));
    }

    #[test]
    fn script_covers_the_fingerprint_surfaces() {
        let script = stealth_script(7);
        for surface in [
            "webdriver",
            "plugins",
            "languages",
            "hardwareConcurrency",
            "permissions.query",
            "getImageData",
            "getParameter",
            "getChannelData",
        ] {
            assert!(script.contains(surface), "missing {surface}");
        }
    }
}
