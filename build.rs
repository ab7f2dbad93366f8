fn main() {
    #[cfg(feature = "caen")]
    caen::generate_bindings();
}

#[cfg(feature = "caen")]
mod caen {
    use std::{env, path::PathBuf};

    pub fn generate_bindings() {
        println!("cargo:rustc-link-lib=CAENDigitizer");
        println!("cargo:rerun-if-changed=wrapper.h");

        let bindings = bindgen::Builder::default()
            .header("wrapper.h")
            .allowlist_function("CAEN_DGTZ_.*")
            .allowlist_type("CAEN_DGTZ_.*")
            .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
            .generate()
            .expect("unable to generate CAENDigitizer bindings");

        let out_path = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
        bindings
            .write_to_file(out_path.join("bindings.rs"))
            .expect("couldn't write bindings");
    }
}
