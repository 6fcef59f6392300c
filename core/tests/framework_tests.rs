use rsis_core::{ConfigStatus, Framework, FrameworkConfig, FrameworkState, RsisError};
use rsis_model_helper::{
    field, ChannelRx, ChannelTx, Channels, Model, Reflected, Reflector, RuntimeStatus,
};
use std::ffi::CStr;
use std::mem::{offset_of, size_of};

#[derive(Default)]
#[repr(C)]
struct AccIn {
    gain: f64,
}

#[derive(Default)]
#[repr(C)]
struct AccOut {
    total: f64,
}

#[derive(Default)]
#[repr(C)]
struct AccData {
    steps: u32,
    history: [i16; 4],
    pauses: u32,
}

#[derive(Default)]
#[repr(C)]
struct AccParams {
    limit: f64,
    reshape: bool,
}

/// Adds its gain to a running total each step
#[derive(Default)]
#[repr(C)]
struct Accumulator {
    input: AccIn,
    output: AccOut,
    data: AccData,
    params: AccParams,
}

macro_rules! section {
    ($ty:ty, $name:literal) => {
        impl Reflected for $ty {
            fn type_name() -> &'static str {
                $name
            }
        }
    };
}

section!(AccIn, "acc_in");
section!(AccOut, "acc_out");
section!(AccData, "acc_data");
section!(AccParams, "acc_params");

impl Model for Accumulator {
    const TYPE_NAME: &'static CStr = c"accumulator";

    fn reflect(r: &mut Reflector) {
        r.class("acc_in")
            .field("acc_in", field::<f64>("gain", offset_of!(AccIn, gain)).units("1/step"));
        r.class("acc_out")
            .field("acc_out", field::<f64>("total", offset_of!(AccOut, total)));
        r.class("acc_data")
            .field("acc_data", field::<u32>("steps", offset_of!(AccData, steps)))
            .field("acc_data", field::<[i16; 4]>("history", offset_of!(AccData, history)))
            .field("acc_data", field::<u32>("pauses", offset_of!(AccData, pauses)));
        r.class("acc_params")
            .field("acc_params", field::<f64>("limit", offset_of!(AccParams, limit)))
            .field("acc_params", field::<bool>("reshape", offset_of!(AccParams, reshape)));
        r.class("accumulator")
            .field("accumulator", field::<AccIn>("in", offset_of!(Accumulator, input)))
            .field("accumulator", field::<AccOut>("out", offset_of!(Accumulator, output)))
            .field("accumulator", field::<AccData>("data", offset_of!(Accumulator, data)))
            .field("accumulator", field::<AccParams>("params", offset_of!(Accumulator, params)));
    }

    fn config(&mut self) -> ConfigStatus {
        if self.params.limit < 0.0 {
            return ConfigStatus::Error;
        }
        if self.params.reshape {
            self.params.reshape = false;
            return ConfigStatus::InterfaceUpdate;
        }
        ConfigStatus::Ok
    }

    fn init(&mut self, _channels: &mut Channels<'_>) -> RuntimeStatus {
        self.output.total = 0.0;
        self.data.steps = 0;
        RuntimeStatus::Ok
    }

    fn step(&mut self) -> RuntimeStatus {
        self.output.total += self.input.gain;
        self.data.steps += 1;
        if self.params.limit > 0.0 && self.output.total > self.params.limit {
            return RuntimeStatus::Error;
        }
        RuntimeStatus::Ok
    }

    fn pause(&mut self) -> RuntimeStatus {
        self.data.pauses += 1;
        RuntimeStatus::Ok
    }
}

#[derive(Default)]
#[repr(C)]
struct RelayIo {
    value: f64,
}

#[derive(Default)]
#[repr(C)]
struct RelayData {
    received: u32,
}

/// Channel ids, zero for none
#[derive(Default)]
#[repr(C)]
struct RelayParams {
    source: i64,
    sink: i64,
}

/// Sends its input over one channel and reads the latest value off another
#[derive(Default)]
struct Relay {
    input: RelayIo,
    output: RelayIo,
    data: RelayData,
    params: RelayParams,
    rx: Option<ChannelRx>,
    tx: Option<ChannelTx>,
}

section!(RelayIo, "relay_io");
section!(RelayData, "relay_data");
section!(RelayParams, "relay_params");

impl Model for Relay {
    const TYPE_NAME: &'static CStr = c"relay";

    fn reflect(r: &mut Reflector) {
        r.class("relay_io")
            .field("relay_io", field::<f64>("value", offset_of!(RelayIo, value)));
        r.class("relay_data")
            .field("relay_data", field::<u32>("received", offset_of!(RelayData, received)));
        r.class("relay_params")
            .field("relay_params", field::<i64>("source", offset_of!(RelayParams, source)))
            .field("relay_params", field::<i64>("sink", offset_of!(RelayParams, sink)));
        r.class("relay")
            .field("relay", field::<RelayIo>("in", offset_of!(Relay, input)))
            .field("relay", field::<RelayIo>("out", offset_of!(Relay, output)))
            .field("relay", field::<RelayData>("data", offset_of!(Relay, data)))
            .field("relay", field::<RelayParams>("params", offset_of!(Relay, params)));
    }

    fn config(&mut self) -> ConfigStatus {
        ConfigStatus::Ok
    }

    fn init(&mut self, channels: &mut Channels<'_>) -> RuntimeStatus {
        if self.params.source != 0 {
            self.rx = channels.request_rx(self.params.source);
            if self.rx.is_none() {
                return RuntimeStatus::Error;
            }
        }
        if self.params.sink != 0 {
            self.tx = channels.request_tx(self.params.sink);
            if self.tx.is_none() {
                return RuntimeStatus::Error;
            }
        }
        RuntimeStatus::Ok
    }

    fn step(&mut self) -> RuntimeStatus {
        if let Some(tx) = &mut self.tx {
            if tx.send(&self.input.value.to_ne_bytes()).is_err() {
                return RuntimeStatus::Error;
            }
        }
        if let Some(rx) = &mut self.rx {
            while let Ok(message) = rx.try_recv() {
                if let Ok(bytes) = <[u8; 8]>::try_from(message.as_slice()) {
                    self.output.value = f64::from_ne_bytes(bytes);
                    self.data.received += 1;
                }
            }
        }
        RuntimeStatus::Ok
    }
}

rsis_model_helper::export_models! {
    name: "accumulators",
    version: "0.1.0",
    description: "Running totals for framework tests",
    models: [Accumulator, Relay],
}

fn framework(frequency: f64) -> Framework {
    let fw = Framework::new(FrameworkConfig {
        frequency,
        ..FrameworkConfig::default()
    })
    .unwrap();
    fw.register_static_library("acc", rsis_entry_points()).unwrap();
    fw
}

fn set_f64(fw: &Framework, model: &str, field: &str, value: f64) {
    fw.msg_set(model, field, &value.to_ne_bytes()).unwrap();
}

fn get_f64(fw: &Framework, model: &str, field: &str) -> f64 {
    let bytes = fw.msg_get(model, field).unwrap();
    f64::from_ne_bytes(bytes.try_into().unwrap())
}

fn get_u32(fw: &Framework, model: &str, field: &str) -> u32 {
    let bytes = fw.msg_get(model, field).unwrap();
    u32::from_ne_bytes(bytes.try_into().unwrap())
}

fn set_i64(fw: &Framework, model: &str, field: &str, value: i64) {
    fw.msg_set(model, field, &value.to_ne_bytes()).unwrap();
}

#[test]
fn test_create_unknown_type_leaves_libraries_alone() {
    let fw = framework(1.0);
    let err = fw.create_model("acc", "integrator", "i").unwrap_err();
    assert_eq!(err, RsisError::UnknownModelType("integrator".into()));
    assert_eq!(fw.libraries(), vec!["acc".to_string()]);
    assert!(fw.models().is_empty());

    fw.create_model("acc", "accumulator", "a").unwrap();
    assert_eq!(
        fw.create_model("acc", "accumulator", "a").unwrap_err(),
        RsisError::DuplicateModel("a".into())
    );
}

#[test]
fn test_schema_sections() {
    let fw = framework(1.0);
    fw.create_model("acc", "accumulator", "a").unwrap();
    let schema = fw.schema("a").unwrap();

    let inputs: Vec<&str> = schema.inputs.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(inputs, vec!["in.gain"]);
    assert_eq!(schema.inputs[0].units, "1/step");
    let history = schema.field("data.history").unwrap();
    assert_eq!(history.dims, vec![4]);
    assert_eq!(history.size, 8);
    assert_eq!(schema.field("params").unwrap().size, size_of::<AccParams>());

    let json = fw.schema_json("a").unwrap();
    assert!(json.contains("\"model_type\": \"accumulator\""));
    assert!(json.contains("params.limit"));
}

#[test]
fn test_round_trip_every_declared_field() {
    let fw = framework(1.0);
    fw.create_model("acc", "accumulator", "a").unwrap();
    let schema = fw.schema("a").unwrap();

    for (i, field) in schema.fields().enumerate() {
        let pattern: Vec<u8> = if field.type_name == "bool" {
            vec![1; field.size]
        } else {
            (0..field.size).map(|b| (b + i + 1) as u8).collect()
        };
        fw.msg_set("a", &field.path, &pattern).unwrap();
        assert_eq!(fw.msg_get("a", &field.path).unwrap(), pattern, "{}", field.path);
    }

    assert!(matches!(
        fw.msg_set("a", "in.gain", &[0u8; 4]),
        Err(RsisError::SizeMismatch {
            expected: 8,
            actual: 4,
            ..
        })
    ));
    assert!(matches!(
        fw.msg_get("a", "in.loss"),
        Err(RsisError::UnknownField { .. })
    ));
}

#[test]
fn test_config_statuses() {
    let fw = framework(1.0);
    fw.create_model("acc", "accumulator", "a").unwrap();
    assert_eq!(fw.config_model("a").unwrap(), ConfigStatus::Ok);

    fw.msg_set("a", "params.reshape", &[1]).unwrap();
    assert_eq!(fw.config_model("a").unwrap(), ConfigStatus::InterfaceUpdate);
    assert!(fw.schema("a").unwrap().field("in.gain").is_some());

    set_f64(&fw, "a", "params.limit", -1.0);
    assert!(matches!(
        fw.config_model("a"),
        Err(RsisError::ModelFailure { op: "config", .. })
    ));
}

#[test]
fn test_scheduled_model_steps() {
    let fw = framework(10.0);
    let t = fw.new_thread(10.0).unwrap();
    fw.create_model("acc", "accumulator", "a").unwrap();
    fw.schedule_model("a", t, 5.0, 1).unwrap();
    set_f64(&fw, "a", "in.gain", 2.0);

    fw.init_scheduler(true).unwrap();
    fw.step_scheduler(10, true).unwrap();
    assert_eq!(get_f64(&fw, "a", "out.total"), 10.0);

    assert_eq!(get_u32(&fw, "a", "data.steps"), 5);
}

#[test]
fn test_connection_copies_output() {
    let fw = framework(1.0);
    let t = fw.new_thread(1.0).unwrap();
    fw.create_model("acc", "accumulator", "src").unwrap();
    fw.create_model("acc", "accumulator", "dst").unwrap();
    fw.schedule_model("src", t, 1.0, 0).unwrap();
    fw.connect("src", "out.total", "dst", "in.gain", t, 1.0, 0).unwrap();
    fw.schedule_model("dst", t, 1.0, 0).unwrap();
    set_f64(&fw, "src", "in.gain", 1.0);

    assert!(matches!(
        fw.connect("src", "out.total", "dst", "data.steps", t, 1.0, 0),
        Err(RsisError::SizeMismatch { .. })
    ));

    fw.init_scheduler(true).unwrap();
    fw.step_scheduler(3, true).unwrap();
    // dst accumulates the running total of src: 1 + 2 + 3
    assert_eq!(get_f64(&fw, "dst", "out.total"), 6.0);
}

#[test]
fn test_model_failure_pauses_run() {
    let fw = framework(1.0);
    let t = fw.new_thread(1.0).unwrap();
    fw.create_model("acc", "accumulator", "a").unwrap();
    fw.schedule_model("a", t, 1.0, 0).unwrap();
    set_f64(&fw, "a", "in.gain", 1.0);
    set_f64(&fw, "a", "params.limit", 2.5);

    fw.init_scheduler(true).unwrap();
    let err = fw.run_scheduler(true).unwrap_err();
    assert!(matches!(err, RsisError::ModelFailure { op: "step", .. }));
    assert_eq!(fw.state(), FrameworkState::Pause);
    assert_eq!(fw.time().step, 3);
    // A failed pass pauses models the same way a halted one does
    assert_eq!(get_u32(&fw, "a", "data.pauses"), 1);

    fw.msg_set("a", "params.limit", &0.0f64.to_ne_bytes()).unwrap();
    fw.step_scheduler(1, true).unwrap();
    assert_eq!(get_u32(&fw, "a", "data.pauses"), 2);
}

#[test]
fn test_invalid_bool_write_is_refused() {
    let fw = framework(1.0);
    fw.create_model("acc", "accumulator", "a").unwrap();
    assert_eq!(
        fw.msg_set("a", "params.reshape", &[2]).unwrap_err(),
        RsisError::InvalidValue {
            model: "a".into(),
            field: "params.reshape".into()
        }
    );
    assert_eq!(fw.msg_get("a", "params.reshape").unwrap(), vec![0]);

    // Whole-section writes are checked on the bool they cover
    let mut params = fw.msg_get("a", "params").unwrap();
    let reshape = offset_of!(AccParams, reshape);
    params[reshape] = 0xff;
    assert!(matches!(
        fw.msg_set("a", "params", &params),
        Err(RsisError::InvalidValue { .. })
    ));
    params[reshape] = 1;
    fw.msg_set("a", "params", &params).unwrap();
    assert_eq!(fw.msg_get("a", "params.reshape").unwrap(), vec![1]);
}

#[test]
fn test_models_talk_over_channels() {
    let fw = framework(1.0);
    let t = fw.new_thread(1.0).unwrap();
    for name in ["tx", "rx", "tap"] {
        fw.create_model("acc", "relay", name).unwrap();
        fw.schedule_model(name, t, 1.0, 0).unwrap();
    }
    set_i64(&fw, "tx", "params.sink", 5);
    set_i64(&fw, "rx", "params.source", 5);
    set_i64(&fw, "tap", "params.sink", 6);
    set_f64(&fw, "tx", "in.value", 4.5);
    set_f64(&fw, "tap", "in.value", -1.0);
    let host_rx = fw.channels().request_rx(6).unwrap();

    fw.init_scheduler(true).unwrap();
    fw.step_scheduler(3, true).unwrap();
    assert_eq!(get_f64(&fw, "rx", "out.value"), 4.5);
    assert_eq!(get_u32(&fw, "rx", "data.received"), 3);

    let seen: Vec<Vec<u8>> = host_rx.try_iter().collect();
    assert_eq!(seen, vec![(-1.0f64).to_ne_bytes().to_vec(); 3]);
}

#[test]
fn test_second_receiver_fails_init() {
    let fw = framework(1.0);
    fw.create_model("acc", "relay", "first").unwrap();
    fw.create_model("acc", "relay", "second").unwrap();
    set_i64(&fw, "first", "params.source", 8);
    set_i64(&fw, "second", "params.source", 8);

    assert!(matches!(
        fw.init_scheduler(true),
        Err(RsisError::ModelFailure { op: "init", .. })
    ));
    assert_eq!(fw.state(), FrameworkState::Config);
}

#[test]
fn test_remove_model_unschedules_it() {
    let fw = framework(1.0);
    let t = fw.new_thread(1.0).unwrap();
    fw.create_model("acc", "accumulator", "a").unwrap();
    fw.create_model("acc", "accumulator", "b").unwrap();
    fw.schedule_model("a", t, 1.0, 0).unwrap();
    fw.schedule_model("b", t, 1.0, 0).unwrap();

    fw.remove_model("a").unwrap();
    assert_eq!(fw.models(), vec!["b".to_string()]);
    assert_eq!(
        fw.remove_model("a").unwrap_err(),
        RsisError::UnknownModel("a".into())
    );

    // Unlike destroy, the thread no longer steps the removed model
    fw.init_scheduler(true).unwrap();
    fw.step_scheduler(2, true).unwrap();
    assert_eq!(get_u32(&fw, "b", "data.steps"), 2);
    assert!(matches!(
        fw.unload_library("acc"),
        Err(RsisError::LibraryInUse { instances: 1, .. })
    ));
}

#[test]
fn test_destroyed_model_fails_next_tick() {
    let fw = framework(1.0);
    let t = fw.new_thread(1.0).unwrap();
    fw.create_model("acc", "accumulator", "a").unwrap();
    fw.schedule_model("a", t, 1.0, 0).unwrap();
    fw.init_scheduler(true).unwrap();
    fw.step_scheduler(1, true).unwrap();

    fw.destroy_model("a").unwrap();
    assert_eq!(
        fw.step_scheduler(1, true).unwrap_err(),
        RsisError::ModelDestroyed("a".into())
    );
}

#[test]
fn test_unload_refused_while_models_live() {
    let fw = framework(1.0);
    fw.create_model("acc", "accumulator", "a").unwrap();
    assert!(matches!(
        fw.unload_library("acc"),
        Err(RsisError::LibraryInUse { instances: 1, .. })
    ));

    fw.destroy_model("a").unwrap();
    fw.unload_library("acc").unwrap();
    assert_eq!(
        fw.unload_library("acc").unwrap_err(),
        RsisError::UnknownLibrary("acc".into())
    );
    assert_eq!(
        fw.create_model("acc", "accumulator", "b").unwrap_err(),
        RsisError::UnknownModelType("accumulator".into())
    );
}

#[test]
fn test_duplicate_static_registration() {
    let fw = framework(1.0);
    assert_eq!(
        fw.register_static_library("acc", rsis_entry_points()).unwrap_err(),
        RsisError::DuplicateLibrary("acc".into())
    );
    // Same model types under another name
    assert!(matches!(
        fw.register_static_library("acc2", rsis_entry_points()),
        Err(RsisError::DuplicateModelType { .. })
    ));
    assert_eq!(fw.libraries(), vec!["acc".to_string()]);
}

#[test]
fn test_shutdown_with_live_model() {
    let fw = framework(1.0);
    let t = fw.new_thread(1.0).unwrap();
    fw.create_model("acc", "accumulator", "a").unwrap();
    fw.schedule_model("a", t, 1.0, 0).unwrap();
    fw.init_scheduler(true).unwrap();
    fw.step_scheduler(2, true).unwrap();

    fw.shutdown();
    assert_eq!(fw.state(), FrameworkState::NoState);
    assert_eq!(fw.msg_get("a", "out.total").unwrap_err(), RsisError::NotAlive);
    assert_eq!(fw.create_model("acc", "accumulator", "b").unwrap_err(), RsisError::NotAlive);
    assert!(fw.libraries().is_empty());
}
