//! Schema-level end-to-end scenarios.

use fab_core::Chip;

#[test]
fn test_set_get_add_scenario() {
    let mut chip = Chip::new(None);

    chip.set(&["design"], "top");
    assert_eq!(chip.get_str(&["design"]).as_deref(), Some("top"));

    chip.add(&["source"], "hello.v");
    chip.add(&["source"], "world.v");
    assert_eq!(
        chip.get_strings(&["source"]),
        vec!["hello.v".to_string(), "world.v".to_string()]
    );
    assert!(!chip.has_error());

    // appending to a scalar parameter trips the error latch
    chip.add(&["design"], "x");
    assert!(chip.has_error());
}

#[test]
fn test_default_wildcard_scenario() {
    let mut chip = Chip::new(Some("top"));

    assert!(chip.getkeys(&["stdcell"]).is_empty());
    chip.set(&["stdcell", "NangateOpenCellLibrary", "rev"], "r1p0");

    assert_eq!(
        chip.getkeys(&["stdcell"]),
        vec!["NangateOpenCellLibrary".to_string()]
    );
    assert_eq!(
        chip.get_str(&["stdcell", "NangateOpenCellLibrary", "rev"]).as_deref(),
        Some("r1p0")
    );
    assert!(!chip.has_error());
}

#[test]
fn test_clobber_false_write_is_noop() {
    let mut chip = Chip::new(None);
    chip.set(&["mode"], "asic");
    chip.set_clobber(&["mode"], "fpga", false);
    assert_eq!(chip.get_str(&["mode"]).as_deref(), Some("asic"));
}

#[test]
fn test_error_latch_is_monotonic() {
    let mut chip = Chip::new(Some("top"));
    chip.add(&["design"], "x");
    assert!(chip.has_error());

    // later successful operations do not clear the latch
    chip.set(&["mode"], "asic");
    assert_eq!(chip.get_str(&["mode"]).as_deref(), Some("asic"));
    assert!(chip.has_error());
}
