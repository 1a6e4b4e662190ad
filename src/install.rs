use std::path::Path;

use crate::adb::AdbSession;
use crate::error::Result;
use crate::sync;

pub const REMOTE_TMP_DIR: &str = "/data/local/tmp";

/// Pushes the APK to the device tmp dir, runs `pm install -r`, then cleans
/// the upload up. Cleanup failures are logged and swallowed; everything else
/// aborts the workflow.
///
/// Human-readable status lines go to `sink`; callers render them verbatim.
/// Returns the trimmed `pm install` output.
pub fn install_apk(
    session: &mut AdbSession,
    apk: &Path,
    sink: &mut dyn FnMut(&str),
) -> Result<String> {
    let remote = format!("{}/{}", REMOTE_TMP_DIR, remote_name(apk));

    sink("Uploading APK...");
    {
        let mut stream = session.open("sync:")?;
        sync::push_file(&mut stream, apk, &remote, &mut |sent, total| {
            if total > 0 {
                sink(&format!("Uploading APK... {}%", sent * 100 / total));
            }
        })?;
        stream.close()?;
    }

    sink("Installing APK...");
    let output = session.run_shell(&format!("pm install -r {remote}"))?;
    let output = output.trim().to_string();
    if !output.is_empty() {
        sink(&output);
    }

    if let Err(e) = session.run_shell(&format!("rm {remote}")) {
        log::warn!("could not remove {remote}: {e}");
    }

    sink("Install complete.");
    Ok(output)
}

/// Device-side file name: the local name with anything shell-hostile
/// replaced.
fn remote_name(apk: &Path) -> String {
    let name = apk.file_name().and_then(|n| n.to_str()).unwrap_or("payload.apk");
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}
