fn main() {
    prost_build::Config::new()
        .compile_protos(&["proto/mvcc.proto"], &["proto/"])
        .expect("failed to compile proto/mvcc.proto");
    println!("cargo:rerun-if-changed=proto/mvcc.proto");
}
