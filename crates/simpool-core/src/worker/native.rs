//! Session server speaking the native codec.
//!
//! ```text
//! RUN  -> ACK, { path -> ACK, type:i32 -> ACK, value -> ACK }*, FIN -> ACK
//!      <- FIN | ERR message
//! READ -> ACK, table -> ACK, { field -> ACK }*, FIN -> ACK
//!      <- FIN count:i32 { name type:i32 column }* | ERR message
//! ```

use std::io::{Read, Write};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ipc::native::{ACK, ERR, FIN, ParamType, READ, RUN};
use crate::ipc::{NativeChannel, Override, ReadCommand, RunCommand, Table, Value};
use crate::runnable::CancelSignal;

use super::Session;

/// Serves `RUN` and `READ` requests from a non-Rust client.
pub struct NativeServer<R, W> {
    channel: NativeChannel<R, W>,
    session: Session,
    cancel: CancelSignal,
}

impl<R: Read, W: Write> NativeServer<R, W> {
    pub fn new(channel: NativeChannel<R, W>, session: Session) -> Self {
        Self {
            channel,
            session,
            cancel: CancelSignal::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Serve until the client closes the channel.
    pub fn serve(&mut self) -> Result<()> {
        loop {
            let token = match self.channel.read_string() {
                Ok(token) => token,
                Err(Error::ChannelClosed) => {
                    info!("native client closed the channel");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            debug!(%token, "native command");
            match token.as_str() {
                RUN => self.handle_run()?,
                READ => self.handle_read()?,
                other => {
                    warn!(token = other, "unknown native command");
                    return Err(Error::Protocol(format!("unknown native command {:?}", other)));
                }
            }
        }
    }

    fn ack(&mut self) -> Result<()> {
        self.channel.write_string(ACK)
    }

    fn fail(&mut self, message: &str) -> Result<()> {
        self.channel.write_string(ERR)?;
        self.channel.write_string(message)
    }

    fn handle_run(&mut self) -> Result<()> {
        self.ack()?;
        let mut command = RunCommand::default();
        loop {
            let path = self.channel.read_string()?;
            self.ack()?;
            if path == FIN {
                break;
            }
            let param_type = ParamType::try_from(self.channel.read_int()?)?;
            self.ack()?;
            let value = self.read_param(param_type)?;
            self.ack()?;
            command.overrides.push(Override::new(path, value));
        }

        match self.session.run(&command, &self.cancel) {
            Ok(()) => self.channel.write_string(FIN),
            Err(e) => self.fail(&format!("{:#}", e)),
        }
    }

    /// Replacement value in its textual override form.
    fn read_param(&mut self, param_type: ParamType) -> Result<String> {
        Ok(match param_type {
            ParamType::Int => self.channel.read_int()?.to_string(),
            ParamType::Double => self.channel.read_double()?.to_string(),
            ParamType::Bool => self.channel.read_bool()?.to_string(),
            // Packed yyyymmdd, rendered as an ISO date.
            ParamType::Date => Value::Date(self.channel.read_int()?).to_string(),
            ParamType::String => self.channel.read_string()?,
        })
    }

    fn handle_read(&mut self) -> Result<()> {
        self.ack()?;
        let table_name = self.channel.read_string()?;
        self.ack()?;
        let mut field_names = Vec::new();
        loop {
            let field = self.channel.read_string()?;
            self.ack()?;
            if field == FIN {
                break;
            }
            field_names.push(field);
        }

        match self.session.read(&ReadCommand {
            table_name,
            field_names,
        }) {
            Ok(table) => self.write_table(&table),
            Err(e) => self.fail(&e.to_string()),
        }
    }

    fn write_table(&mut self, table: &Table) -> Result<()> {
        self.channel.write_string(FIN)?;
        self.channel.write_int(table.columns.len() as i32)?;
        for (idx, column) in table.columns.iter().enumerate() {
            let values: Vec<Value> = table.rows.iter().map(|row| row[idx].clone()).collect();
            self.channel.write_string(&column.name)?;
            self.channel.write_int(column_type(&values) as i32)?;
            self.channel.write_column(&values)?;
        }
        Ok(())
    }
}

/// Element type of an encoded column, from its first non-null value.
pub fn column_type(values: &[Value]) -> ParamType {
    match values.iter().find(|v| !v.is_null()) {
        Some(Value::Int(_)) => ParamType::Int,
        Some(Value::Double(_)) => ParamType::Double,
        Some(Value::Bool(_)) => ParamType::Bool,
        Some(Value::Date(_)) => ParamType::Date,
        Some(Value::Text(_)) | Some(Value::Null) | None => ParamType::String,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ipc::JobSpec;
    use crate::ipc::native::{decode_doubles, decode_ints};
    use crate::runnable::Registry;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;

    fn start() -> (NativeChannel<UnixStream, UnixStream>, std::thread::JoinHandle<Result<()>>) {
        let (client, server) = UnixStream::pair().unwrap();
        let session = Session::new(Arc::new(Registry::with_builtins()), vec![JobSpec::new("clock", "Sim")]);
        let handle = std::thread::spawn(move || {
            NativeServer::new(NativeChannel::new(server.try_clone().unwrap(), server), session).serve()
        });
        (NativeChannel::new(client.try_clone().unwrap(), client), handle)
    }

    #[test]
    fn test_run_then_read_columns() {
        let (mut client, server) = start();

        client.send_acked(RUN).unwrap();
        client.send_acked("[Clock].StartDate").unwrap();
        client.write_int(ParamType::String as i32).unwrap();
        client.expect_token(ACK).unwrap();
        client.write_string("2000-01-08").unwrap();
        client.expect_token(ACK).unwrap();
        client.send_acked("[Crop].GrowthRate").unwrap();
        client.write_int(ParamType::Double as i32).unwrap();
        client.expect_token(ACK).unwrap();
        client.write_double(2.5).unwrap();
        client.expect_token(ACK).unwrap();
        client.send_acked(FIN).unwrap();
        client.expect_token(FIN).unwrap();

        client.send_acked(READ).unwrap();
        client.send_acked("Report").unwrap();
        client.send_acked("Date").unwrap();
        client.send_acked("Yield").unwrap();
        client.send_acked(FIN).unwrap();
        client.expect_token(FIN).unwrap();
        assert_eq!(client.read_int().unwrap(), 2);

        assert_eq!(client.read_string().unwrap(), "Date");
        assert_eq!(client.read_int().unwrap(), ParamType::Date as i32);
        let dates = decode_ints(&client.read_bytes().unwrap()).unwrap();
        assert_eq!(dates, vec![20000108, 20000109, 20000110]);

        assert_eq!(client.read_string().unwrap(), "Yield");
        assert_eq!(client.read_int().unwrap(), ParamType::Double as i32);
        let yields = decode_doubles(&client.read_bytes().unwrap()).unwrap();
        assert_eq!(yields, vec![2.5, 5.0, 7.5]);

        drop(client);
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_read_missing_table_is_err_token() {
        let (mut client, server) = start();
        client.send_acked(READ).unwrap();
        client.send_acked("Nope").unwrap();
        client.send_acked(FIN).unwrap();
        client.expect_token(ERR).unwrap();
        assert!(client.read_string().unwrap().contains("Nope"));
        drop(client);
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_column_type() {
        assert_eq!(column_type(&[Value::Null, Value::Int(1)]), ParamType::Int);
        assert_eq!(column_type(&[]), ParamType::String);
    }
}
