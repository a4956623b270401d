fn main() {
    // ── macOS: Bluetooth permission for a bare binary ─────────────────────────
    //
    // CoreBluetooth never reports the adapter as powered on to a process that
    // lacks NSBluetoothAlwaysUsageDescription.  `ble-image-rx` ships without
    // an app bundle, so Info.plist is linked into the binary's
    // `__TEXT,__info_plist` section instead.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }
    let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        return;
    };
    let plist = std::path::Path::new(&manifest_dir).join("Info.plist");

    for arg in ["-sectcreate", "__TEXT", "__info_plist"] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
    println!("cargo:rustc-link-arg-bins={}", plist.display());
    println!("cargo:rerun-if-changed=Info.plist");
}
