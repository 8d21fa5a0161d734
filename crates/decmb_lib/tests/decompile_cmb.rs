use decmb_lib::{decompile, decompile_with_options, DecompileMode, DecompileOptions, Dialect};

fn put_u16(data: &mut [u8], at: usize, value: u16) {
    data[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(data: &mut [u8], at: usize, value: u32) {
    data[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_scene_header(
    data: &mut [u8],
    at: usize,
    name_off: u32,
    script_off: u32,
    kind: u8,
    args: u8,
    index: u16,
    vars: u16,
) {
    put_u32(data, at, name_off);
    put_u32(data, at + 0x04, script_off);
    data[at + 0x0C] = kind;
    data[at + 0x0D] = args;
    data[at + 0x0E] = 0; // parameters
    put_u16(data, at + 0x10, index);
    put_u16(data, at + 0x12, vars);
}

/// Two scenes over a shared string pool:
///
/// `foo` branches over its argument, `unk_1` (anonymous) calls the
/// external `greet` and discards the result.
fn sample_container() -> Vec<u8> {
    let mut data = vec![0u8; 0x7B];

    put_u16(&mut data, 0x22, 2); // globals
    put_u32(&mut data, 0x24, 0x2C); // string pool
    put_u32(&mut data, 0x28, 0x36); // event table

    data[0x2C..0x36].copy_from_slice(b"foo\0greet\0");

    put_u32(&mut data, 0x36, 0x42);
    put_u32(&mut data, 0x3A, 0x56);
    put_u32(&mut data, 0x3E, 0); // terminator

    put_scene_header(&mut data, 0x42, 0x2C, 0x6A, 0, 1, 0, 2);
    put_scene_header(&mut data, 0x56, 0, 0x73, 3, 0, 1, 0);

    // val arg_0, bn -> 8, number 5, ret, retn
    data[0x6A..0x73].copy_from_slice(&[0x01, 0x00, 0x3D, 0x00, 0x05, 0x19, 0x05, 0x39, 0x45]);

    // number 2, callext greet/1, disc, retn
    data[0x73..0x7B].copy_from_slice(&[0x19, 0x02, 0x38, 0x00, 0x04, 0x01, 0x20, 0x45]);

    data
}

#[test]
fn decompiles_sample_container() {
    let out = decompile(&sample_container()).unwrap();

    let expected = "\
VARIABLE glob_0;
VARIABLE glob_1;

EVENT foo(arg_0) global
{
  goto label_8 if !arg_0;

  return 5;

label_8:
  return 0;
}

EVENT unk_1()
{
  greet(2);
  return 0;
}

";

    assert_eq!(out, expected);
}

#[test]
fn disassembles_sample_container() {
    let out = decompile_with_options(
        &sample_container(),
        DecompileOptions {
            mode: DecompileMode::Disasm,
            dialect: Dialect::D10,
        },
    )
    .unwrap();

    let expected = "\
VARIABLE glob_0;
VARIABLE glob_1;

event foo (kind=function, args=1, vars=2)
00000 val      0 ; arg_0
00002 bn       8
00005 number   5
00007 ret
00008 retn

event unk_1 (kind=turn3, args=0, vars=0)
00000 number   2
00002 call     1025 ; greet (1 args)
00006 disc
00007 retn

";

    assert_eq!(out, expected);
}

#[test]
fn reports_failed_scene_and_continues() {
    // Anonymous scene whose script opens with an undefined opcode.
    let mut data = vec![0u8; 0x49];

    put_u32(&mut data, 0x24, 0x2C); // empty string pool
    put_u32(&mut data, 0x28, 0x2C); // event table

    put_u32(&mut data, 0x2C, 0x34);
    put_u32(&mut data, 0x30, 0); // terminator

    put_scene_header(&mut data, 0x34, 0, 0x48, 0, 0, 0, 0);
    data[0x48] = 0x60;

    let out = decompile(&data).unwrap();

    let expected = "\
EVENT unk_0()
{
FAILED unk_0: invalid opcode: 0x60
}

";

    assert_eq!(out, expected);
}

#[test]
fn d9_rejects_d10_only_opcodes() {
    // The retn terminating `unk_1` only exists in D10.
    let out = decompile_with_options(
        &sample_container(),
        DecompileOptions {
            mode: DecompileMode::Pseudo,
            dialect: Dialect::D9,
        },
    )
    .unwrap();

    assert!(out.contains("FAILED foo"));
    assert!(out.contains("FAILED unk_1"));
}
