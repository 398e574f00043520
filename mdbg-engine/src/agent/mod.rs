// Debug agent client
//
// `AgentConnection` implements the native debugging contract on top of a TCP
// connection to an agent running inside the target process. Requests are
// command packets answered by replies; notifications arrive as event packets
// and are handed to the session as `NativeEvent`s.

pub mod commands;
pub mod eventloop;
pub mod events;
pub mod protocol;
pub mod reader;

use crate::error::{NativeError, NativeResult};
use crate::native::{
    FieldInfo, LaunchRequest, LocalValue, MethodDesc, NamedValue, NativeDebugger, NativeEvent,
    NativeFrame, NativeThread, StepMode, TypeInfo,
};
use crate::symbols::ModuleSymbols;
use crate::types::{
    EvalId, MethodRef, ModuleId, NativeBreakpointId, Primitive, RemoteValue, ThreadId, TypeRef,
};
use async_trait::async_trait;
use bytes::BufMut;
use commands::*;
use eventloop::{spawn_event_loop, EventLoopHandle};
use protocol::{CommandPacket, HANDSHAKE};
use reader::*;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct AgentConnection {
    event_loop: EventLoopHandle,
    next_id: AtomicU32,
}

impl AgentConnection {
    /// Connect to the agent listening at `host:port`. Returns the connection
    /// and the stream of notifications it decodes.
    pub async fn connect(
        host: &str,
        port: u16,
    ) -> NativeResult<(Self, mpsc::UnboundedReceiver<NativeEvent>)> {
        info!("Connecting to debug agent at {}:{}", host, port);

        let mut stream = TcpStream::connect((host, port)).await?;
        Self::handshake(&mut stream).await?;

        let (reader, writer) = stream.into_split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let event_loop = spawn_event_loop(reader, writer, event_tx);

        Ok((
            Self {
                event_loop,
                next_id: AtomicU32::new(1),
            },
            event_rx,
        ))
    }

    async fn handshake(stream: &mut TcpStream) -> NativeResult<()> {
        debug!("Performing agent handshake");

        stream.write_all(HANDSHAKE).await?;
        stream.flush().await?;

        let mut buf = vec![0u8; HANDSHAKE.len()];
        stream.read_exact(&mut buf).await?;

        if buf != HANDSHAKE {
            warn!("Invalid handshake response: {:?}", buf);
            return Err(NativeError::InvalidHandshake);
        }

        info!("Agent handshake successful");
        Ok(())
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn packet(&self, command_set: u8, command: u8) -> CommandPacket {
        CommandPacket::new(self.next_id(), command_set, command)
    }

    /// Send a command and hand the reply payload to `decode`.
    async fn request<T>(
        &self,
        packet: CommandPacket,
        decode: impl FnOnce(&mut &[u8]) -> NativeResult<T>,
    ) -> NativeResult<T> {
        let data = self.event_loop.send_command(packet).await?.into_result()?;
        decode(&mut data.as_slice())
    }

    async fn execute(&self, packet: CommandPacket) -> NativeResult<()> {
        self.request(packet, |_| Ok(())).await
    }

    fn value_packet(&self, command: u8, value: &RemoteValue) -> CommandPacket {
        let mut packet = self.packet(command_sets::VALUE, command);
        packet.data.put_u64(value.id.0);
        packet
    }
}

#[async_trait]
impl NativeDebugger for AgentConnection {
    async fn launch(&self, request: &LaunchRequest) -> NativeResult<u32> {
        let mut packet = self.packet(command_sets::PROCESS, process_commands::LAUNCH);
        put_string(&mut packet.data, &request.program);
        packet.data.put_i32(request.args.len() as i32);
        for arg in &request.args {
            put_string(&mut packet.data, arg);
        }
        put_string(&mut packet.data, request.cwd.as_deref().unwrap_or(""));
        packet.data.put_i32(request.env.len() as i32);
        for (key, value) in &request.env {
            put_string(&mut packet.data, key);
            put_string(&mut packet.data, value);
        }
        let pid = self.request(packet, read_u32).await?;
        info!("Launched {} as process {}", request.program, pid);
        Ok(pid)
    }

    async fn attach(&self, pid: u32) -> NativeResult<()> {
        let mut packet = self.packet(command_sets::PROCESS, process_commands::ATTACH);
        packet.data.put_u32(pid);
        self.execute(packet).await
    }

    async fn detach(&self) -> NativeResult<()> {
        self.execute(self.packet(command_sets::PROCESS, process_commands::DETACH))
            .await
    }

    async fn terminate(&self) -> NativeResult<()> {
        self.execute(self.packet(command_sets::PROCESS, process_commands::TERMINATE))
            .await
    }

    async fn continue_process(&self) -> NativeResult<()> {
        self.execute(self.packet(command_sets::PROCESS, process_commands::CONTINUE))
            .await
    }

    async fn stop_process(&self) -> NativeResult<()> {
        self.execute(self.packet(command_sets::PROCESS, process_commands::STOP))
            .await
    }

    async fn create_breakpoint(
        &self,
        method: MethodRef,
        offset: u32,
    ) -> NativeResult<NativeBreakpointId> {
        let mut packet = self.packet(command_sets::BREAKPOINT, breakpoint_commands::CREATE);
        put_method_ref(&mut packet.data, method);
        packet.data.put_u32(offset);
        let id = self.request(packet, read_u32).await?;
        debug!("Created breakpoint {} at {:?}+{:#x}", id, method, offset);
        Ok(NativeBreakpointId(id))
    }

    async fn set_breakpoint_active(
        &self,
        breakpoint: NativeBreakpointId,
        active: bool,
    ) -> NativeResult<()> {
        let mut packet = self.packet(command_sets::BREAKPOINT, breakpoint_commands::SET_ACTIVE);
        packet.data.put_u32(breakpoint.0);
        packet.data.put_u8(active as u8);
        self.execute(packet).await
    }

    async fn step(&self, thread: ThreadId, mode: StepMode) -> NativeResult<()> {
        let mut packet = self.packet(command_sets::STEPPER, stepper_commands::STEP);
        packet.data.put_u32(thread);
        match mode {
            StepMode::Range { step_in, start, end } => {
                packet.data.put_u8(step_modes::RANGE);
                packet.data.put_u8(step_in as u8);
                packet.data.put_u32(start);
                packet.data.put_u32(end);
            }
            StepMode::Instruction { step_in } => {
                packet.data.put_u8(step_modes::INSTRUCTION);
                packet.data.put_u8(step_in as u8);
            }
            StepMode::Out => packet.data.put_u8(step_modes::OUT),
        }
        self.execute(packet).await
    }

    async fn cancel_step(&self, thread: ThreadId) -> NativeResult<()> {
        let mut packet = self.packet(command_sets::STEPPER, stepper_commands::CANCEL);
        packet.data.put_u32(thread);
        self.execute(packet).await
    }

    async fn threads(&self) -> NativeResult<Vec<NativeThread>> {
        let packet = self.packet(command_sets::PROCESS, process_commands::THREADS);
        self.request(packet, |data| read_list(data, read_thread)).await
    }

    async fn frames(&self, thread: ThreadId) -> NativeResult<Vec<NativeFrame>> {
        let mut packet = self.packet(command_sets::FRAME, frame_commands::FRAMES);
        packet.data.put_u32(thread);
        self.request(packet, |data| read_list(data, read_frame)).await
    }

    async fn arguments(&self, thread: ThreadId, depth: u32) -> NativeResult<Vec<NamedValue>> {
        let mut packet = self.packet(command_sets::FRAME, frame_commands::ARGUMENTS);
        packet.data.put_u32(thread);
        packet.data.put_u32(depth);
        self.request(packet, |data| {
            read_list(data, |data| {
                Ok(NamedValue {
                    name: read_string(data)?,
                    value: read_value(data)?,
                })
            })
        })
        .await
    }

    async fn locals(&self, thread: ThreadId, depth: u32) -> NativeResult<Vec<LocalValue>> {
        let mut packet = self.packet(command_sets::FRAME, frame_commands::LOCALS);
        packet.data.put_u32(thread);
        packet.data.put_u32(depth);
        self.request(packet, |data| {
            read_list(data, |data| {
                Ok(LocalValue {
                    slot: read_u32(data)?,
                    value: read_value(data)?,
                })
            })
        })
        .await
    }

    async fn method_desc(&self, method: MethodRef) -> NativeResult<MethodDesc> {
        let mut packet = self.packet(command_sets::METADATA, metadata_commands::METHOD_DESC);
        put_method_ref(&mut packet.data, method);
        self.request(packet, read_method_desc).await
    }

    async fn module_symbols(&self, module: ModuleId) -> NativeResult<Option<ModuleSymbols>> {
        let mut packet = self.packet(command_sets::METADATA, metadata_commands::MODULE_SYMBOLS);
        packet.data.put_u64(module.0);
        let symbols = self
            .request(packet, |data| read_option(data, read_module_symbols))
            .await?;
        match &symbols {
            Some(s) => debug!("Module {:?}: {} methods with symbols", module, s.methods.len()),
            None => debug!("Module {:?} has no symbols", module),
        }
        Ok(symbols)
    }

    async fn read_primitive(&self, value: &RemoteValue) -> NativeResult<Primitive> {
        let packet = self.value_packet(value_commands::READ_PRIMITIVE, value);
        self.request(packet, reader::read_primitive).await
    }

    async fn read_string(&self, value: &RemoteValue) -> NativeResult<String> {
        let packet = self.value_packet(value_commands::READ_STRING, value);
        self.request(packet, reader::read_string).await
    }

    async fn unbox(&self, value: &RemoteValue) -> NativeResult<RemoteValue> {
        let packet = self.value_packet(value_commands::UNBOX, value);
        self.request(packet, read_value).await
    }

    async fn object_address(&self, value: &RemoteValue) -> NativeResult<u64> {
        let packet = self.value_packet(value_commands::OBJECT_ADDRESS, value);
        self.request(packet, read_u64).await
    }

    async fn type_of(&self, value: &RemoteValue) -> NativeResult<TypeRef> {
        let mut packet = self.packet(command_sets::METADATA, metadata_commands::TYPE_OF);
        packet.data.put_u64(value.id.0);
        self.request(packet, read_type_ref).await
    }

    async fn type_info(&self, ty: &TypeRef) -> NativeResult<TypeInfo> {
        let mut packet = self.packet(command_sets::METADATA, metadata_commands::TYPE_INFO);
        put_type_ref(&mut packet.data, ty);
        self.request(packet, read_type_info).await
    }

    async fn find_type(&self, module: ModuleId, name: &str) -> NativeResult<Option<TypeRef>> {
        let mut packet = self.packet(command_sets::METADATA, metadata_commands::FIND_TYPE);
        packet.data.put_u64(module.0);
        put_string(&mut packet.data, name);
        self.request(packet, |data| read_option(data, read_type_ref)).await
    }

    async fn array_dimensions(&self, array: &RemoteValue) -> NativeResult<Vec<u32>> {
        let packet = self.value_packet(value_commands::ARRAY_DIMENSIONS, array);
        self.request(packet, |data| read_list(data, read_u32)).await
    }

    async fn array_element(
        &self,
        array: &RemoteValue,
        indices: &[u32],
    ) -> NativeResult<RemoteValue> {
        let mut packet = self.value_packet(value_commands::ARRAY_ELEMENT, array);
        packet.data.put_i32(indices.len() as i32);
        for index in indices {
            packet.data.put_u32(*index);
        }
        self.request(packet, read_value).await
    }

    async fn field_value(
        &self,
        object: &RemoteValue,
        field: &FieldInfo,
    ) -> NativeResult<RemoteValue> {
        let mut packet = self.value_packet(value_commands::FIELD_VALUE, object);
        packet.data.put_u32(field.token);
        self.request(packet, read_value).await
    }

    async fn static_field_value(
        &self,
        thread: ThreadId,
        ty: &TypeRef,
        field: &FieldInfo,
    ) -> NativeResult<RemoteValue> {
        let mut packet = self.packet(command_sets::VALUE, value_commands::STATIC_FIELD_VALUE);
        packet.data.put_u32(thread);
        put_type_ref(&mut packet.data, ty);
        packet.data.put_u32(field.token);
        self.request(packet, read_value).await
    }

    async fn create_primitive(
        &self,
        thread: ThreadId,
        value: Primitive,
    ) -> NativeResult<RemoteValue> {
        let mut packet = self.packet(command_sets::VALUE, value_commands::CREATE_PRIMITIVE);
        packet.data.put_u32(thread);
        put_primitive(&mut packet.data, value);
        self.request(packet, read_value).await
    }

    async fn create_null(&self, thread: ThreadId) -> NativeResult<RemoteValue> {
        let mut packet = self.packet(command_sets::VALUE, value_commands::CREATE_NULL);
        packet.data.put_u32(thread);
        self.request(packet, read_value).await
    }

    async fn begin_call(
        &self,
        thread: ThreadId,
        method: MethodRef,
        type_args: &[TypeRef],
        args: &[RemoteValue],
    ) -> NativeResult<EvalId> {
        let mut packet = self.packet(command_sets::EVAL, eval_commands::CALL);
        packet.data.put_u32(thread);
        put_method_ref(&mut packet.data, method);
        packet.data.put_i32(type_args.len() as i32);
        for ty in type_args {
            put_type_ref(&mut packet.data, ty);
        }
        packet.data.put_i32(args.len() as i32);
        for arg in args {
            packet.data.put_u64(arg.id.0);
        }
        Ok(EvalId(self.request(packet, read_u64).await?))
    }

    async fn begin_new_string(&self, thread: ThreadId, text: &str) -> NativeResult<EvalId> {
        let mut packet = self.packet(command_sets::EVAL, eval_commands::NEW_STRING);
        packet.data.put_u32(thread);
        put_string(&mut packet.data, text);
        Ok(EvalId(self.request(packet, read_u64).await?))
    }

    async fn abort_eval(&self, eval: EvalId) -> NativeResult<()> {
        let mut packet = self.packet(command_sets::EVAL, eval_commands::ABORT);
        packet.data.put_u64(eval.0);
        self.execute(packet).await
    }

    async fn create_strong_handle(&self, value: &RemoteValue) -> NativeResult<RemoteValue> {
        let mut packet = self.packet(command_sets::HANDLE, handle_commands::CREATE_STRONG);
        packet.data.put_u64(value.id.0);
        self.request(packet, read_value).await
    }

    fn release_handle(&self, handle: &RemoteValue) {
        let mut packet = self.packet(command_sets::HANDLE, handle_commands::RELEASE);
        packet.data.put_u64(handle.id.0);
        self.event_loop.send_detached(packet);
    }
}
