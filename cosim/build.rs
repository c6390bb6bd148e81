use std::env;

fn main() {
  println!("cargo::rerun-if-env-changed=REF_MODULE");
  println!("cargo::rerun-if-env-changed=REF_MODULE_LIB_DIR");
  println!("cargo::rerun-if-env-changed=DESIGN_TIMEOUT");

  if env::var_os("CARGO_FEATURE_STATIC_REF").is_some() {
    if let Ok(dir) = env::var("REF_MODULE_LIB_DIR") {
      println!("cargo::rustc-link-search=native={dir}");
    }
    // nemu-style reference builds ship as lib<name>.a
    let name = env::var("REF_MODULE").unwrap_or_else(|_| "nemu".to_string());
    println!("cargo::rustc-link-lib=static={name}");
  }
}
