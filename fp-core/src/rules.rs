//! Device activation rules (udev)

use std::path::Path;

use tracing::{debug, info};

use crate::constants::{device, paths};
use crate::data::Completion;
use crate::error::Result;
use crate::host::{Host, HostCommand};

/// Rules for the primary driver: reader and character device owned by plugdev
pub fn primary_rules() -> String {
    format!(
        "# {name}\n\
         # Managed by fpinstall; local changes are overwritten.\n\
         SUBSYSTEM==\"usb\", ATTRS{{idVendor}}==\"{vid}\", ATTRS{{idProduct}}==\"{pid}\", MODE=\"0660\", GROUP=\"plugdev\", TAG+=\"uaccess\"\n\
         KERNEL==\"{module}[0-9]*\", MODE=\"0660\", GROUP=\"plugdev\", TAG+=\"uaccess\"\n",
        name = device::DEVICE_NAME,
        vid = device::USB_VENDOR_ID,
        pid = device::USB_PRODUCT_ID,
        module = device::MODULE_NAME,
    )
}

/// Rules handing the reader to libfprint's generic USB handling
pub fn generic_rules() -> String {
    format!(
        "# {name}: generic library handling (fpinstall fallback)\n\
         SUBSYSTEM==\"usb\", ATTRS{{idVendor}}==\"{vid}\", ATTRS{{idProduct}}==\"{pid}\", ENV{{LIBFPRINT_DRIVER}}=\"generic\", ATTR{{power/control}}=\"auto\", TAG+=\"uaccess\"\n",
        name = device::DEVICE_NAME,
        vid = device::USB_VENDOR_ID,
        pid = device::USB_PRODUCT_ID,
    )
}

/// Rules for the user-space driver: raw USB access, kernel driver unbound
pub fn userspace_rules() -> String {
    format!(
        "# {name}: user-space driver (fpinstall fallback)\n\
         SUBSYSTEM==\"usb\", ATTRS{{idVendor}}==\"{vid}\", ATTRS{{idProduct}}==\"{pid}\", MODE=\"0660\", GROUP=\"plugdev\", ENV{{FP_XIAOMI_USERSPACE}}=\"1\"\n",
        name = device::DEVICE_NAME,
        vid = device::USB_VENDOR_ID,
        pid = device::USB_PRODUCT_ID,
    )
}

/// Ask udev to re-read rules and replay events for the reader
pub fn reload_udev(host: &dyn Host) -> Result<()> {
    host.run_checked(&HostCommand::from_argv(&["udevadm", "control", "--reload-rules"]))?;
    host.run_checked(
        &HostCommand::new("udevadm")
            .arg("trigger")
            .arg("--subsystem-match=usb")
            .arg(format!("--attr-match=idVendor={}", device::USB_VENDOR_ID)),
    )?;
    Ok(())
}

/// Write `contents` to `path` unless it already holds exactly that.
/// Returns whether anything changed.
pub fn ensure_rules_file(host: &dyn Host, path: &Path, contents: &str) -> Result<bool> {
    if host.read_file(path)?.as_deref() == Some(contents) {
        debug!("{:?} already up to date", path);
        return Ok(false);
    }
    host.write_file(path, contents)?;
    info!("Wrote {:?}", path);
    Ok(true)
}

/// Install the primary rules; identical content is a no-op
pub fn install(host: &dyn Host) -> Result<Completion> {
    let path = Path::new(paths::UDEV_RULES_FILE);
    if !ensure_rules_file(host, path, &primary_rules())? {
        return Ok(Completion::success(format!("{} already up to date", paths::UDEV_RULES_FILE)));
    }
    reload_udev(host)?;
    Ok(Completion::success(format!("installed {}", paths::UDEV_RULES_FILE)))
}
