#![no_main]

use libfuzzer_sys::fuzz_target;
use dotpatch::{
    assembly::decode_method,
    metadata::{resolver::ModuleResolver, signatures::TypeSignature},
    runtime::{MethodBuilder, Runtime, RuntimeConfig},
};

fuzz_target!(|data: &[u8]| {
    let Ok(runtime) = Runtime::new(RuntimeConfig::default()) else {
        return;
    };
    let Ok(ty) = runtime.define_type("Fuzz", "Target", None) else {
        return;
    };
    let Ok(method) = runtime.define_method(
        MethodBuilder::new(&ty, "Run")
            .param("a", TypeSignature::I4)
            .returns(TypeSignature::I4),
    ) else {
        return;
    };
    let _ = decode_method(data, &ModuleResolver::new(runtime.module()), &method);
});
